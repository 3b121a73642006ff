//! Environment probe.
//!
//! Host-environment detection (connectivity, device class, language) sits
//! behind a small trait so the coordinator, the scheduler and the REST
//! backend never reach for ambient globals directly and tests can inject a
//! deterministic probe.

use std::time::Duration;

/// Answers questions about the host environment.
pub trait EnvironmentProbe: Send + Sync {
    /// Whether the host currently believes it has network connectivity.
    fn is_online(&self) -> bool;

    /// Whether the host is a mobile-classified device.
    fn is_mobile(&self) -> bool;

    /// Preferred UI language, if known (e.g. "en-US").
    fn language(&self) -> Option<String>;
}

/// Request timeout for a backend call given the probed environment.
///
/// Offline mobile hosts fail fast instead of stalling a full timeout on a
/// radio that is known to be down.
pub fn request_timeout(env: &dyn EnvironmentProbe) -> Duration {
    if env.is_mobile() && !env.is_online() {
        Duration::from_secs(5)
    } else {
        Duration::from_secs(30)
    }
}

/// Default probe for desktop/server processes: assumes connectivity,
/// reports language from the process locale.
#[derive(Debug, Default, Clone)]
pub struct StdEnvironment;

impl EnvironmentProbe for StdEnvironment {
    fn is_online(&self) -> bool {
        true
    }

    fn is_mobile(&self) -> bool {
        false
    }

    fn language(&self) -> Option<String> {
        std::env::var("LANG")
            .ok()
            .and_then(|l| l.split('.').next().map(|s| s.replace('_', "-")))
            .filter(|l| !l.is_empty() && l != "C")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OfflinePhone;

    impl EnvironmentProbe for OfflinePhone {
        fn is_online(&self) -> bool {
            false
        }
        fn is_mobile(&self) -> bool {
            true
        }
        fn language(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_timeout_policy() {
        assert_eq!(request_timeout(&StdEnvironment), Duration::from_secs(30));
        assert_eq!(request_timeout(&OfflinePhone), Duration::from_secs(5));
    }
}
