//! Condition variants and their bind/observe/release lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::capabilities::capability::{CapabilityId, CapabilityLookup, CapabilityType};
use crate::capabilities::error::ConditionBindError;
use crate::events::{EventChannel, EventEnvelope, EventHandler, EventKind, SubscriptionToken};

/// Called with the new value each time a bound condition flips.
pub type ChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// The closed set of condition variants, each carrying only what its
/// evaluation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionKind {
    /// At least one non-removed capability of the type exists.
    TypeExists(CapabilityType),
    /// At least one capability of the type is ACTIVE.
    TypeActive(CapabilityType),
    /// The owning capability is not in the middle of an update.
    PassivateDuringUpdate,
    /// Logical AND of the nested conditions.
    All(Vec<ConditionKind>),
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionKind::TypeExists(t) => write!(f, "capability of type '{t}' exists"),
            ConditionKind::TypeActive(t) => write!(f, "capability of type '{t}' is active"),
            ConditionKind::PassivateDuringUpdate => f.write_str("capability is not being updated"),
            ConditionKind::All(kinds) => {
                let parts: Vec<String> = kinds.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(" and "))
            }
        }
    }
}

/// What a condition needs to subscribe and evaluate.
#[derive(Clone)]
pub struct BindContext {
    pub channel: Arc<dyn EventChannel>,
    /// Lookup into the registry; never keeps it alive.
    pub lookup: Weak<dyn CapabilityLookup>,
    /// The capability that owns the condition.
    pub owner: CapabilityId,
}

#[derive(Debug, Default)]
struct ConditionState {
    satisfied: AtomicBool,
    bound: AtomicBool,
    /// Held from evaluation until the result is stored, so concurrent
    /// deliveries cannot store a value read before a newer one.
    evaluating: Mutex<()>,
}

impl ConditionState {
    fn is_satisfied(&self) -> bool {
        self.bound.load(Ordering::SeqCst) && self.satisfied.load(Ordering::SeqCst)
    }

    /// Evaluate and store without notifying.
    fn seed(&self, evaluate: impl FnOnce() -> bool) {
        let _evaluating = self.evaluating.lock();
        self.satisfied.store(evaluate(), Ordering::SeqCst);
    }

    /// Recompute the value; fire `on_change` only on a flip.
    ///
    /// The callback runs after the lock is released. It only reports that
    /// something changed: receivers re-read `is_satisfied`.
    fn observe(&self, evaluate: impl FnOnce() -> bool, on_change: &ChangeCallback) {
        let flipped = {
            let _evaluating = self.evaluating.lock();
            if !self.bound.load(Ordering::SeqCst) {
                return;
            }
            let value = evaluate();
            (self.satisfied.swap(value, Ordering::SeqCst) != value).then_some(value)
        };
        if let Some(value) = flipped {
            on_change(value);
        }
    }
}

/// A condition instance owned by exactly one capability.
pub struct Condition {
    kind: ConditionKind,
    state: Arc<ConditionState>,
    children: Vec<Condition>,
    subscriptions: Vec<SubscriptionToken>,
    channel: Option<Arc<dyn EventChannel>>,
}

impl Condition {
    pub fn new(kind: ConditionKind) -> Self {
        let children = match &kind {
            ConditionKind::All(kinds) => kinds.iter().cloned().map(Condition::new).collect(),
            _ => Vec::new(),
        };
        Self {
            kind,
            state: Arc::new(ConditionState::default()),
            children,
            subscriptions: Vec::new(),
            channel: None,
        }
    }

    pub fn kind(&self) -> &ConditionKind {
        &self.kind
    }

    pub fn is_bound(&self) -> bool {
        self.state.bound.load(Ordering::SeqCst)
    }

    /// Current value. An unbound condition is never satisfied.
    pub fn is_satisfied(&self) -> bool {
        self.state.is_satisfied()
    }

    /// Subscribe to the channel and compute the initial value synchronously.
    ///
    /// The initial value does not fire `on_change`. Binding an already bound
    /// condition is a no-op.
    pub fn bind(&mut self, ctx: &BindContext, on_change: ChangeCallback) -> Result<(), ConditionBindError> {
        if self.is_bound() {
            return Ok(());
        }
        let lookup = ctx.lookup.upgrade().ok_or(ConditionBindError::RegistryUnavailable)?;

        match self.kind.clone() {
            ConditionKind::TypeExists(target) => {
                check_target(&target)?;
                let handler = self.type_handler(ctx, target.clone(), on_change, type_exists);
                self.subscribe(ctx, EventKind::CapabilityCreated, "type-exists", handler.clone());
                self.subscribe(ctx, EventKind::CapabilityRemoved, "type-exists", handler);
                self.state.bound.store(true, Ordering::SeqCst);
                self.state.seed(|| type_exists(lookup.as_ref(), &target));
            }
            ConditionKind::TypeActive(target) => {
                check_target(&target)?;
                let handler = self.type_handler(ctx, target.clone(), on_change, type_active);
                self.subscribe(ctx, EventKind::CapabilityStateChanged, "type-active", handler.clone());
                self.subscribe(ctx, EventKind::CapabilityRemoved, "type-active", handler);
                self.state.bound.store(true, Ordering::SeqCst);
                self.state.seed(|| type_active(lookup.as_ref(), &target));
            }
            ConditionKind::PassivateDuringUpdate => {
                let owner = ctx.owner;
                for (kind, value) in [
                    (EventKind::CapabilityUpdateBegin, false),
                    (EventKind::CapabilityUpdateEnd, true),
                ] {
                    let state = self.state.clone();
                    let on_change = on_change.clone();
                    let handler: EventHandler = Arc::new(move |envelope: &EventEnvelope| {
                        if *envelope.event.capability_id() == owner {
                            state.observe(|| value, &on_change);
                        }
                    });
                    self.subscribe(ctx, kind, "passivate-during-update", handler);
                }
                self.state.bound.store(true, Ordering::SeqCst);
                self.state.seed(|| !lookup.is_updating(&owner));
            }
            ConditionKind::All(_) => {
                let child_states: Vec<Arc<ConditionState>> =
                    self.children.iter().map(|c| c.state.clone()).collect();
                let parent = self.state.clone();
                let recompute: ChangeCallback = Arc::new(move |_: bool| {
                    parent.observe(|| child_states.iter().all(|s| s.is_satisfied()), &on_change);
                });

                for i in 0..self.children.len() {
                    if let Err(e) = self.children[i].bind(ctx, recompute.clone()) {
                        for child in &mut self.children[..i] {
                            child.release();
                        }
                        return Err(e);
                    }
                }
                self.channel = Some(ctx.channel.clone());
                self.state.bound.store(true, Ordering::SeqCst);
                let children = &self.children;
                self.state.seed(|| children.iter().all(Condition::is_satisfied));
            }
        }
        Ok(())
    }

    /// Unsubscribe and mark unbound. Safe to call repeatedly.
    pub fn release(&mut self) {
        {
            let _evaluating = self.state.evaluating.lock();
            self.state.bound.store(false, Ordering::SeqCst);
            self.state.satisfied.store(false, Ordering::SeqCst);
        }
        if let Some(channel) = self.channel.take() {
            for token in self.subscriptions.drain(..) {
                channel.unsubscribe(&token);
            }
        }
        for child in &mut self.children {
            child.release();
        }
    }

    fn subscribe(&mut self, ctx: &BindContext, kind: EventKind, name: &str, handler: EventHandler) {
        let token = ctx
            .channel
            .subscribe(kind, &format!("{name}:{}", ctx.owner), handler);
        self.subscriptions.push(token);
        self.channel = Some(ctx.channel.clone());
    }

    /// Handler recomputing a type-scoped condition through the lookup.
    fn type_handler(
        &self,
        ctx: &BindContext,
        target: CapabilityType,
        on_change: ChangeCallback,
        evaluate: fn(&dyn CapabilityLookup, &CapabilityType) -> bool,
    ) -> EventHandler {
        let state = self.state.clone();
        let lookup = ctx.lookup.clone();
        Arc::new(move |envelope: &EventEnvelope| {
            if envelope.event.capability_type() != Some(&target) {
                return;
            }
            if let Some(lookup) = lookup.upgrade() {
                state.observe(|| evaluate(lookup.as_ref(), &target), &on_change);
            }
        })
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("kind", &self.kind)
            .field("bound", &self.is_bound())
            .field("satisfied", &self.is_satisfied())
            .finish()
    }
}

fn type_exists(lookup: &dyn CapabilityLookup, target: &CapabilityType) -> bool {
    lookup.exists_of_type(target, None)
}

fn type_active(lookup: &dyn CapabilityLookup, target: &CapabilityType) -> bool {
    lookup.active_of_type(target)
}

fn check_target(target: &CapabilityType) -> Result<(), ConditionBindError> {
    if target.as_str().trim().is_empty() {
        return Err(ConditionBindError::InvalidTarget(target.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capability::CapabilityState;
    use crate::events::{CapabilityEvent, EventBus};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    /// Lookup whose contents tests mutate directly.
    #[derive(Default)]
    struct FakeRegistry {
        capabilities: Mutex<HashMap<CapabilityId, (CapabilityType, CapabilityState)>>,
        updating: Mutex<Vec<CapabilityId>>,
    }

    impl FakeRegistry {
        fn put(&self, id: CapabilityId, t: &str, state: CapabilityState) {
            self.capabilities.lock().insert(id, (t.into(), state));
        }

        fn drop_capability(&self, id: &CapabilityId) {
            self.capabilities.lock().remove(id);
        }
    }

    impl CapabilityLookup for FakeRegistry {
        fn capabilities_of_type(&self, t: &CapabilityType) -> Vec<(CapabilityId, CapabilityState)> {
            self.capabilities
                .lock()
                .iter()
                .filter(|(_, (ty, _))| ty == t)
                .map(|(id, (_, state))| (*id, *state))
                .collect()
        }

        fn is_updating(&self, id: &CapabilityId) -> bool {
            self.updating.lock().contains(id)
        }
    }

    struct Harness {
        bus: Arc<EventBus>,
        registry: Arc<FakeRegistry>,
        ctx: BindContext,
        flips: Arc<Mutex<Vec<bool>>>,
    }

    impl Harness {
        fn new() -> Self {
            let bus = Arc::new(EventBus::new());
            let registry = Arc::new(FakeRegistry::default());
            let weak: Weak<FakeRegistry> = Arc::downgrade(&registry);
            let ctx = BindContext {
                channel: bus.clone(),
                lookup: weak,
                owner: CapabilityId::generate(),
            };
            Self {
                bus,
                registry,
                ctx,
                flips: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn callback(&self) -> ChangeCallback {
            let flips = self.flips.clone();
            Arc::new(move |value: bool| flips.lock().push(value))
        }

        fn created(&self, id: CapabilityId, t: &str) {
            self.registry.put(id, t, CapabilityState::New);
            self.bus.publish(CapabilityEvent::CapabilityCreated {
                capability_type: t.into(),
                id,
            });
        }

        fn removed(&self, id: CapabilityId, t: &str) {
            self.registry.drop_capability(&id);
            self.bus.publish(CapabilityEvent::CapabilityRemoved {
                capability_type: t.into(),
                id,
            });
        }

        fn state_changed(&self, id: CapabilityId, t: &str, old: CapabilityState, new: CapabilityState) {
            self.registry.put(id, t, new);
            self.bus.publish(CapabilityEvent::CapabilityStateChanged {
                capability_type: t.into(),
                id,
                old_state: old,
                new_state: new,
            });
        }
    }

    #[test]
    fn test_type_exists_is_edge_triggered() {
        let h = Harness::new();
        let mut condition = Condition::new(ConditionKind::TypeExists("x".into()));
        condition.bind(&h.ctx, h.callback()).unwrap();
        assert!(condition.is_bound());
        assert!(!condition.is_satisfied());

        let first = CapabilityId::generate();
        let second = CapabilityId::generate();
        h.created(first, "x");
        assert!(condition.is_satisfied());
        h.created(second, "x");
        // Duplicate notification for an already-existing type.
        h.bus.publish(CapabilityEvent::CapabilityCreated {
            capability_type: "x".into(),
            id: first,
        });
        assert_eq!(*h.flips.lock(), vec![true]);

        h.removed(first, "x");
        assert!(condition.is_satisfied());
        h.removed(second, "x");
        assert!(!condition.is_satisfied());
        assert_eq!(*h.flips.lock(), vec![true, false]);
    }

    #[test]
    fn test_type_exists_ignores_other_types() {
        let h = Harness::new();
        let mut condition = Condition::new(ConditionKind::TypeExists("x".into()));
        condition.bind(&h.ctx, h.callback()).unwrap();

        h.created(CapabilityId::generate(), "y");
        assert!(!condition.is_satisfied());
        assert!(h.flips.lock().is_empty());
    }

    #[test]
    fn test_initial_value_computed_at_bind_without_callback() {
        let h = Harness::new();
        h.registry.put(CapabilityId::generate(), "x", CapabilityState::Active);

        let mut exists = Condition::new(ConditionKind::TypeExists("x".into()));
        let mut active = Condition::new(ConditionKind::TypeActive("x".into()));
        exists.bind(&h.ctx, h.callback()).unwrap();
        active.bind(&h.ctx, h.callback()).unwrap();

        assert!(exists.is_satisfied());
        assert!(active.is_satisfied());
        assert!(h.flips.lock().is_empty());
    }

    #[test]
    fn test_type_active_follows_state_changes() {
        let h = Harness::new();
        let mut condition = Condition::new(ConditionKind::TypeActive("alpha".into()));
        condition.bind(&h.ctx, h.callback()).unwrap();

        let id = CapabilityId::generate();
        h.created(id, "alpha");
        assert!(!condition.is_satisfied());

        h.state_changed(id, "alpha", CapabilityState::Validating, CapabilityState::Active);
        assert!(condition.is_satisfied());
        h.state_changed(id, "alpha", CapabilityState::Active, CapabilityState::Passive);
        assert!(!condition.is_satisfied());
        h.state_changed(id, "alpha", CapabilityState::Passive, CapabilityState::Active);
        h.removed(id, "alpha");
        assert_eq!(*h.flips.lock(), vec![true, false, true, false]);
    }

    #[test]
    fn test_passivate_during_update_tracks_owner_only() {
        let h = Harness::new();
        let mut condition = Condition::new(ConditionKind::PassivateDuringUpdate);
        condition.bind(&h.ctx, h.callback()).unwrap();
        assert!(condition.is_satisfied());

        let other = CapabilityId::generate();
        h.bus.publish(CapabilityEvent::CapabilityUpdateBegin { id: other });
        assert!(condition.is_satisfied());

        h.bus.publish(CapabilityEvent::CapabilityUpdateBegin { id: h.ctx.owner });
        assert!(!condition.is_satisfied());
        h.bus.publish(CapabilityEvent::CapabilityUpdateEnd { id: h.ctx.owner });
        assert!(condition.is_satisfied());
        assert_eq!(*h.flips.lock(), vec![false, true]);
    }

    #[test]
    fn test_passivate_during_update_bound_mid_update_starts_unsatisfied() {
        let h = Harness::new();
        h.registry.updating.lock().push(h.ctx.owner);

        let mut condition = Condition::new(ConditionKind::PassivateDuringUpdate);
        condition.bind(&h.ctx, h.callback()).unwrap();
        assert!(!condition.is_satisfied());
    }

    #[test]
    fn test_all_flips_only_when_composite_changes() {
        let h = Harness::new();
        let mut condition = Condition::new(ConditionKind::All(vec![
            ConditionKind::TypeExists("a".into()),
            ConditionKind::TypeExists("b".into()),
        ]));
        condition.bind(&h.ctx, h.callback()).unwrap();

        let a = CapabilityId::generate();
        h.created(a, "a");
        assert!(!condition.is_satisfied());
        assert!(h.flips.lock().is_empty());

        h.created(CapabilityId::generate(), "b");
        assert!(condition.is_satisfied());

        h.removed(a, "a");
        assert!(!condition.is_satisfied());
        assert_eq!(*h.flips.lock(), vec![true, false]);
    }

    #[test]
    fn test_invalid_target_fails_bind_and_leaves_no_subscriptions() {
        let h = Harness::new();
        let mut condition = Condition::new(ConditionKind::All(vec![
            ConditionKind::TypeExists("ok".into()),
            ConditionKind::TypeActive("  ".into()),
        ]));
        let err = condition.bind(&h.ctx, h.callback()).unwrap_err();
        assert_eq!(err, ConditionBindError::InvalidTarget("  ".into()));
        assert!(!condition.is_bound());
        assert!(!condition.is_satisfied());
        assert_eq!(h.bus.handler_count(EventKind::CapabilityCreated), 0);
    }

    #[test]
    fn test_bind_without_registry_fails() {
        let h = Harness::new();
        let ctx = BindContext {
            lookup: Weak::<FakeRegistry>::new(),
            ..h.ctx.clone()
        };
        let mut condition = Condition::new(ConditionKind::PassivateDuringUpdate);
        assert_eq!(
            condition.bind(&ctx, h.callback()).unwrap_err(),
            ConditionBindError::RegistryUnavailable
        );
    }

    #[test]
    fn test_release_unsubscribes_and_silences() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut condition = Condition::new(ConditionKind::TypeExists("x".into()));
        condition
            .bind(&h.ctx, Arc::new(move |_: bool| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(h.bus.handler_count(EventKind::CapabilityCreated), 1);

        condition.release();
        condition.release();
        assert!(!condition.is_bound());
        assert_eq!(h.bus.handler_count(EventKind::CapabilityCreated), 0);

        h.created(CapabilityId::generate(), "x");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!condition.is_satisfied());
    }

    #[test]
    fn test_drop_releases_subscriptions() {
        let h = Harness::new();
        {
            let mut condition = Condition::new(ConditionKind::TypeActive("x".into()));
            condition.bind(&h.ctx, h.callback()).unwrap();
            assert_eq!(h.bus.handler_count(EventKind::CapabilityStateChanged), 1);
        }
        assert_eq!(h.bus.handler_count(EventKind::CapabilityStateChanged), 0);
        assert_eq!(h.bus.handler_count(EventKind::CapabilityRemoved), 0);
    }

    /// Lookup whose next armed read blocks after sampling its answer.
    #[derive(Default)]
    struct StallingLookup {
        active: AtomicBool,
        stall: Mutex<Option<(Arc<Barrier>, Arc<Barrier>)>>,
    }

    impl CapabilityLookup for StallingLookup {
        fn capabilities_of_type(&self, _: &CapabilityType) -> Vec<(CapabilityId, CapabilityState)> {
            let state = if self.active.load(Ordering::SeqCst) {
                CapabilityState::Active
            } else {
                CapabilityState::Passive
            };
            let stall = self.stall.lock().take();
            if let Some((sampled, resume)) = stall {
                sampled.wait();
                resume.wait();
            }
            vec![(CapabilityId::generate(), state)]
        }

        fn is_updating(&self, _: &CapabilityId) -> bool {
            false
        }
    }

    #[test]
    fn test_concurrent_deliveries_never_store_a_stale_value() {
        let bus = Arc::new(EventBus::new());
        let lookup = Arc::new(StallingLookup::default());
        lookup.active.store(true, Ordering::SeqCst);
        let weak: Weak<StallingLookup> = Arc::downgrade(&lookup);
        let ctx = BindContext {
            channel: bus.clone(),
            lookup: weak,
            owner: CapabilityId::generate(),
        };
        let mut condition = Condition::new(ConditionKind::TypeActive("alpha".into()));
        condition.bind(&ctx, Arc::new(|_: bool| {})).unwrap();
        assert!(condition.is_satisfied());

        // Drop to false first so the stalled read below is a flip back to true.
        lookup.active.store(false, Ordering::SeqCst);
        bus.publish(CapabilityEvent::CapabilityRemoved {
            capability_type: "alpha".into(),
            id: CapabilityId::generate(),
        });
        assert!(!condition.is_satisfied());

        let sampled = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        *lookup.stall.lock() = Some((sampled.clone(), resume.clone()));
        lookup.active.store(true, Ordering::SeqCst);

        // Samples "active" and stalls before storing it.
        let stale = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                bus.publish(CapabilityEvent::CapabilityStateChanged {
                    capability_type: "alpha".into(),
                    id: CapabilityId::generate(),
                    old_state: CapabilityState::Passive,
                    new_state: CapabilityState::Active,
                });
            })
        };
        sampled.wait();

        // The registry moves on; a later delivery must win.
        lookup.active.store(false, Ordering::SeqCst);
        let fresh = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                bus.publish(CapabilityEvent::CapabilityRemoved {
                    capability_type: "alpha".into(),
                    id: CapabilityId::generate(),
                });
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        resume.wait();

        stale.join().unwrap();
        fresh.join().unwrap();
        assert!(!condition.is_satisfied());
    }

    #[test]
    fn test_display() {
        let kind = ConditionKind::All(vec![
            ConditionKind::TypeActive("alpha".into()),
            ConditionKind::PassivateDuringUpdate,
        ]);
        assert_eq!(
            kind.to_string(),
            "(capability of type 'alpha' is active and capability is not being updated)"
        );
    }
}
