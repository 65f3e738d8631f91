//! Capability Registry: owns every capability instance and drives its
//! lifecycle state machine.
//!
//! Locking:
//! - `index` guards the id map and the per-type index. It is held across the
//!   uniqueness check and the insert in `create`, and never while publishing.
//! - Each capability has its own `inner` mutex serializing its transitions.
//!   Direct operations block on it. Condition callbacks only `try_lock`; when
//!   that fails they leave a pending flag which the holder drains before it
//!   lets go, so a flip is applied strictly before or after any operation.
//! - Readable state lives in `view` and is written only by the `inner` holder.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::capability::{
    BehaviorFactory, CapabilityBehavior, CapabilityId, CapabilityLookup, CapabilityRequest,
    CapabilitySnapshot, CapabilityState, CapabilityType, CapabilityUpdate, NoopBehavior,
    Properties,
};
use super::descriptor::DescriptorProvider;
use super::error::{ActivationError, CapabilityError, ValidationErrors};
use super::validator::Validator;
use crate::conditions::{BindContext, ChangeCallback, Condition};
use crate::events::channel::panic_message;
use crate::events::{CapabilityEvent, EventChannel};

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

struct EntryView {
    properties: Properties,
    notes: Option<String>,
    enabled: bool,
    state: CapabilityState,
    last_error: Option<String>,
}

struct EntryInner {
    behavior: Box<dyn CapabilityBehavior>,
    conditions: Vec<Condition>,
    /// False until every condition bound successfully.
    conditions_bound: bool,
}

struct CapabilityEntry {
    id: CapabilityId,
    capability_type: CapabilityType,
    /// Creation order, for listing.
    seq: u64,
    unique: bool,
    updating: AtomicBool,
    /// A condition flipped while `inner` was held elsewhere.
    pending: AtomicBool,
    view: RwLock<EntryView>,
    inner: Mutex<EntryInner>,
}

impl CapabilityEntry {
    fn state(&self) -> CapabilityState {
        self.view.read().state
    }
}

#[derive(Default)]
struct RegistryIndex {
    by_id: HashMap<CapabilityId, Arc<CapabilityEntry>>,
    by_type: HashMap<CapabilityType, Vec<CapabilityId>>,
}

impl RegistryIndex {
    fn insert(&mut self, entry: Arc<CapabilityEntry>) {
        self.by_type
            .entry(entry.capability_type.clone())
            .or_default()
            .push(entry.id);
        self.by_id.insert(entry.id, entry);
    }

    fn remove(&mut self, entry: &CapabilityEntry) {
        self.by_id.remove(&entry.id);
        if let Some(ids) = self.by_type.get_mut(&entry.capability_type) {
            ids.retain(|id| *id != entry.id);
            if ids.is_empty() {
                self.by_type.remove(&entry.capability_type);
            }
        }
    }

    fn of_type<'a>(
        &'a self,
        capability_type: &CapabilityType,
    ) -> impl Iterator<Item = &'a Arc<CapabilityEntry>> + 'a {
        self.by_type
            .get(capability_type)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
    }

    /// Whether a live capability of the type claims it exclusively.
    fn claimed_exclusively(&self, capability_type: &CapabilityType) -> bool {
        self.of_type(capability_type)
            .any(|e| e.unique && !e.state().is_removed())
    }
}

impl CapabilityLookup for RegistryIndex {
    fn capabilities_of_type(
        &self,
        capability_type: &CapabilityType,
    ) -> Vec<(CapabilityId, CapabilityState)> {
        self.of_type(capability_type)
            .map(|e| (e.id, e.state()))
            .collect()
    }

    fn is_updating(&self, id: &CapabilityId) -> bool {
        self.by_id
            .get(id)
            .is_some_and(|e| e.updating.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

/// Owns all capability instances.
///
/// Always handled through an `Arc`: conditions reach back into the registry
/// through a weak lookup handle. Operations must not be called from inside an
/// event handler; handlers that need registry state use the read-only
/// [`CapabilityLookup`] methods.
pub struct CapabilityRegistry {
    me: Weak<CapabilityRegistry>,
    channel: Arc<dyn EventChannel>,
    validator: Validator,
    factories: RwLock<HashMap<CapabilityType, BehaviorFactory>>,
    index: RwLock<RegistryIndex>,
    next_seq: AtomicU64,
}

impl CapabilityRegistry {
    pub fn new(
        channel: Arc<dyn EventChannel>,
        descriptors: Arc<dyn DescriptorProvider>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            channel,
            validator: Validator::new(descriptors),
            factories: RwLock::new(HashMap::new()),
            index: RwLock::new(RegistryIndex::default()),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Register the behavior factory for a capability type.
    ///
    /// Applies to capabilities created afterwards. Types without a factory get
    /// a behavior with no hooks and no conditions.
    pub fn register_factory(&self, capability_type: impl Into<CapabilityType>, factory: BehaviorFactory) {
        let capability_type = capability_type.into();
        tracing::debug!(capability_type = %capability_type, "registered behavior factory");
        self.factories.write().insert(capability_type, factory);
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn channel(&self) -> &Arc<dyn EventChannel> {
        &self.channel
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Create a capability and settle it in ACTIVE or PASSIVE.
    ///
    /// Validation failures leave the registry untouched. Condition and
    /// behavior failures still create the capability, in FAILED.
    pub fn create(
        &self,
        capability_type: impl Into<CapabilityType>,
        properties: Properties,
        enabled: bool,
    ) -> Result<CapabilityId, CapabilityError> {
        self.create_with(
            CapabilityRequest::new(capability_type)
                .with_properties(properties)
                .enabled(enabled),
        )
    }

    pub fn create_with(&self, request: CapabilityRequest) -> Result<CapabilityId, CapabilityError> {
        let CapabilityRequest {
            capability_type,
            properties,
            enabled,
            notes,
            unique_per_type,
        } = request;

        let errors = self.validator.validate(&capability_type, &properties);
        if !errors.is_empty() {
            return Err(ValidationErrors(errors).into());
        }

        let unique = unique_per_type || self.descriptor_unique(&capability_type);
        let entry = Arc::new(CapabilityEntry {
            id: CapabilityId::generate(),
            capability_type: capability_type.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            unique,
            updating: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            view: RwLock::new(EntryView {
                properties: properties.clone(),
                notes,
                enabled,
                state: CapabilityState::New,
                last_error: None,
            }),
            inner: Mutex::new(EntryInner {
                behavior: self.new_behavior(&capability_type),
                conditions: Vec::new(),
                conditions_bound: false,
            }),
        });

        // Locked before it is visible: no callback may reconcile it half-built.
        let mut inner = entry.inner.lock();
        {
            let mut index = self.index.write();
            let taken = (unique
                && !self
                    .validator
                    .validate_uniqueness(&capability_type, None, &*index))
                || index.claimed_exclusively(&capability_type);
            if taken {
                return Err(
                    ValidationErrors(vec![self.validator.uniqueness_error(&capability_type)]).into(),
                );
            }
            index.insert(entry.clone());
        }

        tracing::info!(
            capability_id = %entry.id,
            capability_type = %capability_type,
            unique,
            enabled,
            "capability created"
        );
        self.channel.publish(CapabilityEvent::CapabilityCreated {
            capability_type,
            id: entry.id,
        });
        self.transition(&entry, CapabilityState::Validating);

        match guarded(|| inner.behavior.on_create(&properties)) {
            Ok(()) => {
                self.bind_conditions(&entry, &mut inner, &properties);
                self.reconcile(&entry, &mut inner);
            }
            Err(e) => self.fail(&entry, e.message()),
        }

        let id = entry.id;
        self.unlock(&entry, inner);
        Ok(id)
    }

    /// Reconfigure a capability.
    ///
    /// The capability is held passive from update-begin to update-end; its
    /// conditions are rebuilt from the new properties. Updating a FAILED
    /// capability clears the failure.
    pub fn update(
        &self,
        id: &CapabilityId,
        properties: Properties,
        enabled: bool,
    ) -> Result<(), CapabilityError> {
        self.update_with(
            id,
            CapabilityUpdate {
                properties,
                enabled,
                notes: None,
            },
        )
    }

    pub fn update_with(&self, id: &CapabilityId, update: CapabilityUpdate) -> Result<(), CapabilityError> {
        let entry = self.live_entry(id)?;
        let errors = self.validator.validate(&entry.capability_type, &update.properties);
        if !errors.is_empty() {
            return Err(ValidationErrors(errors).into());
        }

        let mut inner = entry.inner.lock();
        let result = self.apply_update(&entry, &mut inner, update);
        self.unlock(&entry, inner);
        result
    }

    /// Remove a capability, passivating it first if it is ACTIVE.
    ///
    /// Waits for an in-flight update of the same capability to finish.
    /// Returns the final snapshot.
    pub fn remove(&self, id: &CapabilityId) -> Result<CapabilitySnapshot, CapabilityError> {
        let entry = self.live_entry(id)?;
        let mut inner = entry.inner.lock();
        let result = self.apply_remove(&entry, &mut inner);
        self.unlock(&entry, inner);
        result
    }

    pub fn enable(&self, id: &CapabilityId) -> Result<(), CapabilityError> {
        self.set_enabled(id, true)
    }

    /// Force the capability PASSIVE. Its conditions stay bound.
    pub fn disable(&self, id: &CapabilityId) -> Result<(), CapabilityError> {
        self.set_enabled(id, false)
    }

    /// Clear a FAILED capability: rebind its conditions and re-evaluate.
    ///
    /// No-op for capabilities that are not FAILED.
    pub fn retry(&self, id: &CapabilityId) -> Result<(), CapabilityError> {
        let entry = self.live_entry(id)?;
        let mut inner = entry.inner.lock();
        let result = match entry.state() {
            CapabilityState::Removed => Err(CapabilityError::NotFound(*id)),
            CapabilityState::Failed => {
                tracing::info!(capability_id = %entry.id, "retrying failed capability");
                self.transition(&entry, CapabilityState::Validating);
                let properties = entry.view.read().properties.clone();
                self.bind_conditions(&entry, &mut inner, &properties);
                self.reconcile(&entry, &mut inner);
                Ok(())
            }
            _ => Ok(()),
        };
        self.unlock(&entry, inner);
        result
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &CapabilityId) -> Option<CapabilitySnapshot> {
        self.entry(id).map(|e| self.snapshot(&e))
    }

    /// Every capability, in creation order.
    pub fn list(&self) -> Vec<CapabilitySnapshot> {
        let mut entries: Vec<Arc<CapabilityEntry>> =
            self.index.read().by_id.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| self.snapshot(e)).collect()
    }

    pub fn list_by_type(&self, capability_type: &CapabilityType) -> Vec<CapabilitySnapshot> {
        let entries: Vec<Arc<CapabilityEntry>> =
            self.index.read().of_type(capability_type).cloned().collect();
        entries.iter().map(|e| self.snapshot(e)).collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn entry(&self, id: &CapabilityId) -> Option<Arc<CapabilityEntry>> {
        self.index.read().by_id.get(id).cloned()
    }

    fn live_entry(&self, id: &CapabilityId) -> Result<Arc<CapabilityEntry>, CapabilityError> {
        self.entry(id)
            .filter(|e| !e.state().is_removed())
            .ok_or(CapabilityError::NotFound(*id))
    }

    fn descriptor_unique(&self, capability_type: &CapabilityType) -> bool {
        self.validator
            .descriptors()
            .get(capability_type)
            .is_some_and(|d| d.unique)
    }

    fn new_behavior(&self, capability_type: &CapabilityType) -> Box<dyn CapabilityBehavior> {
        let factory = self.factories.read().get(capability_type).cloned();
        match factory {
            Some(factory) => factory(capability_type),
            None => Box::new(NoopBehavior),
        }
    }

    fn apply_update(
        &self,
        entry: &CapabilityEntry,
        inner: &mut EntryInner,
        update: CapabilityUpdate,
    ) -> Result<(), CapabilityError> {
        if entry.state().is_removed() {
            return Err(CapabilityError::NotFound(entry.id));
        }
        if entry.unique
            && !self.validator.validate_uniqueness(
                &entry.capability_type,
                Some(&entry.id),
                &*self.index.read(),
            )
        {
            return Err(
                ValidationErrors(vec![self.validator.uniqueness_error(&entry.capability_type)])
                    .into(),
            );
        }

        // Passive before anyone sees update-begin.
        entry.updating.store(true, Ordering::SeqCst);
        self.reconcile(entry, inner);
        self.channel
            .publish(CapabilityEvent::CapabilityUpdateBegin { id: entry.id });

        inner.conditions.clear();
        inner.conditions_bound = false;

        let CapabilityUpdate {
            properties,
            enabled,
            notes,
        } = update;
        let was_failed = {
            let mut view = entry.view.write();
            view.properties = properties.clone();
            view.enabled = enabled;
            if notes.is_some() {
                view.notes = notes;
            }
            view.state == CapabilityState::Failed
        };
        if was_failed {
            self.transition(entry, CapabilityState::Validating);
        }

        // Conditions are rebound even when the hook fails: FAILED stays bound.
        let updated = guarded(|| inner.behavior.on_update(&properties));
        self.bind_conditions(entry, inner, &properties);
        if let Err(e) = updated {
            self.fail(entry, e.message());
        }

        entry.updating.store(false, Ordering::SeqCst);
        self.channel
            .publish(CapabilityEvent::CapabilityUpdateEnd { id: entry.id });
        tracing::debug!(capability_id = %entry.id, enabled, "capability updated");

        self.reconcile(entry, inner);
        Ok(())
    }

    fn apply_remove(
        &self,
        entry: &CapabilityEntry,
        inner: &mut EntryInner,
    ) -> Result<CapabilitySnapshot, CapabilityError> {
        let state = entry.state();
        if state.is_removed() {
            return Err(CapabilityError::NotFound(entry.id));
        }

        if state.is_active() {
            if let Err(e) = guarded(|| inner.behavior.on_passivate()) {
                tracing::warn!(capability_id = %entry.id, error = %e, "passivation failed during removal");
            }
            self.transition(entry, CapabilityState::Passive);
        }
        inner.conditions.clear();
        inner.conditions_bound = false;
        if let Err(e) = guarded(|| inner.behavior.on_remove()) {
            tracing::warn!(capability_id = %entry.id, error = %e, "capability cleanup failed");
        }

        self.transition(entry, CapabilityState::Removed);
        self.index.write().remove(entry);
        tracing::info!(
            capability_id = %entry.id,
            capability_type = %entry.capability_type,
            "capability removed"
        );
        self.channel.publish(CapabilityEvent::CapabilityRemoved {
            capability_type: entry.capability_type.clone(),
            id: entry.id,
        });
        Ok(self.snapshot(entry))
    }

    fn set_enabled(&self, id: &CapabilityId, enabled: bool) -> Result<(), CapabilityError> {
        let entry = self.live_entry(id)?;
        let mut inner = entry.inner.lock();
        let result = if entry.state().is_removed() {
            Err(CapabilityError::NotFound(*id))
        } else {
            entry.view.write().enabled = enabled;
            self.reconcile(&entry, &mut inner);
            Ok(())
        };
        self.unlock(&entry, inner);
        result
    }

    /// Build the behavior's conditions and bind them. Any bind failure drops
    /// them all and fails the capability.
    fn bind_conditions(&self, entry: &CapabilityEntry, inner: &mut EntryInner, properties: &Properties) {
        inner.conditions.clear();
        inner.conditions_bound = false;

        let ctx = BindContext {
            channel: self.channel.clone(),
            lookup: self.me.clone(),
            owner: entry.id,
        };
        let on_change = self.change_callback(entry.id);

        let kinds = inner.behavior.conditions(properties);
        let mut conditions = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let mut condition = Condition::new(kind);
            if let Err(e) = condition.bind(&ctx, on_change.clone()) {
                drop(conditions);
                self.fail(entry, &e.to_string());
                return;
            }
            conditions.push(condition);
        }

        inner.conditions = conditions;
        inner.conditions_bound = true;
    }

    fn change_callback(&self, id: CapabilityId) -> ChangeCallback {
        let registry = self.me.clone();
        Arc::new(move |satisfied: bool| {
            if let Some(registry) = registry.upgrade() {
                tracing::trace!(capability_id = %id, satisfied, "condition flipped");
                registry.condition_changed(&id);
            }
        })
    }

    /// Runs on the event delivery context. Never blocks.
    fn condition_changed(&self, id: &CapabilityId) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        entry.pending.store(true, Ordering::SeqCst);
        let guard = entry.inner.try_lock();
        if let Some(inner) = guard {
            self.unlock(&entry, inner);
        }
    }

    /// Drain pending flips, then release the capability's lock.
    fn unlock<'a>(&self, entry: &'a CapabilityEntry, mut inner: MutexGuard<'a, EntryInner>) {
        loop {
            while entry.pending.swap(false, Ordering::SeqCst) {
                self.reconcile(entry, &mut inner);
            }
            drop(inner);

            // A flip may have landed between the last drain and the unlock.
            if !entry.pending.load(Ordering::SeqCst) {
                return;
            }
            match entry.inner.try_lock() {
                Some(guard) => inner = guard,
                None => return,
            }
        }
    }

    /// Move between ACTIVE and PASSIVE according to the composite gate.
    ///
    /// NEW, FAILED and REMOVED capabilities are left alone.
    fn reconcile(&self, entry: &CapabilityEntry, inner: &mut EntryInner) {
        let (state, enabled) = {
            let view = entry.view.read();
            (view.state, view.enabled)
        };
        if !matches!(
            state,
            CapabilityState::Validating | CapabilityState::Active | CapabilityState::Passive
        ) {
            return;
        }

        let gate = enabled
            && !entry.updating.load(Ordering::SeqCst)
            && inner.conditions_bound
            && inner.conditions.iter().all(Condition::is_satisfied);

        match (state, gate) {
            (CapabilityState::Active, true) | (CapabilityState::Passive, false) => {}
            (_, true) => match guarded(|| inner.behavior.on_activate()) {
                Ok(()) => self.transition(entry, CapabilityState::Active),
                Err(e) => self.fail(entry, e.message()),
            },
            (_, false) => {
                let passivated = if state.is_active() {
                    guarded(|| inner.behavior.on_passivate())
                } else {
                    Ok(())
                };
                match passivated {
                    Ok(()) => self.transition(entry, CapabilityState::Passive),
                    Err(e) => self.fail(entry, e.message()),
                }
            }
        }
    }

    fn transition(&self, entry: &CapabilityEntry, to: CapabilityState) {
        self.commit(entry, to, None);
    }

    fn fail(&self, entry: &CapabilityEntry, message: &str) {
        tracing::warn!(
            capability_id = %entry.id,
            capability_type = %entry.capability_type,
            error = message,
            "capability failed"
        );
        self.commit(entry, CapabilityState::Failed, Some(message.to_string()));
    }

    /// Write the new state, then publish it. Leaving FAILED clears the error.
    fn commit(&self, entry: &CapabilityEntry, to: CapabilityState, error: Option<String>) {
        let from = {
            let mut view = entry.view.write();
            let from = view.state;
            if from == to {
                if error.is_some() {
                    view.last_error = error;
                }
                return;
            }
            view.state = to;
            if !to.is_removed() {
                view.last_error = error;
            }
            from
        };

        tracing::debug!(
            capability_id = %entry.id,
            capability_type = %entry.capability_type,
            from = %from,
            to = %to,
            "capability state changed"
        );
        self.channel.publish(CapabilityEvent::CapabilityStateChanged {
            capability_type: entry.capability_type.clone(),
            id: entry.id,
            old_state: from,
            new_state: to,
        });
    }

    fn snapshot(&self, entry: &CapabilityEntry) -> CapabilitySnapshot {
        let type_name = self.validator.type_name(&entry.capability_type);
        let view = entry.view.read();
        CapabilitySnapshot {
            id: entry.id,
            capability_type: entry.capability_type.clone(),
            type_name,
            properties: view.properties.clone(),
            notes: view.notes.clone(),
            enabled: view.enabled,
            state: view.state,
            last_error: view.last_error.clone(),
            unique: entry.unique,
        }
    }
}

impl CapabilityLookup for CapabilityRegistry {
    fn capabilities_of_type(
        &self,
        capability_type: &CapabilityType,
    ) -> Vec<(CapabilityId, CapabilityState)> {
        self.index.read().capabilities_of_type(capability_type)
    }

    fn is_updating(&self, id: &CapabilityId) -> bool {
        self.index.read().is_updating(id)
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.len())
            .field("factories", &self.factories.read().len())
            .finish_non_exhaustive()
    }
}

/// Run a behavior hook, turning a panic into an activation error.
fn guarded(hook: impl FnOnce() -> Result<(), ActivationError>) -> Result<(), ActivationError> {
    catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|panic| {
        Err(ActivationError::new(format!(
            "behavior panicked: {}",
            panic_message(&*panic)
        )))
    })
}
