//! Tracing subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info,capabilities=debug";

static INIT: OnceLock<bool> = OnceLock::new();

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (or [`DEFAULT_FILTER`]).
///
/// Only the first call installs anything. Returns whether a subscriber from
/// this crate is active; `false` means another global subscriber was already
/// set by the host application.
pub fn init_tracing(default_filter: Option<&str>) -> bool {
    *INIT.get_or_init(|| {
        let fallback = default_filter.unwrap_or(DEFAULT_FILTER).to_string();
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
            .try_init()
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let first = init_tracing(None);
        let second = init_tracing(Some("warn"));
        assert_eq!(first, second);
        tracing::debug!("tracing initialized");
    }
}
