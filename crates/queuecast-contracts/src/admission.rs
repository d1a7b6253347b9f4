use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identities currently holding an in-flight heavy request.
///
/// Membership is only ever granted through [`AdmissionControl::try_acquire`]
/// and only ever revoked by dropping the returned guard, so every exit path
/// (return, `?`, panic unwind) releases the identity.
#[derive(Debug, Default)]
pub struct AdmissionControl {
    active: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Busy {
    pub identity: String,
}

impl fmt::Display for Busy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity '{}' already has a request in flight", self.identity)
    }
}

impl std::error::Error for Busy {}

impl AdmissionControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>, identity: &str) -> Result<AdmissionGuard, Busy> {
        let mut active = self.lock();
        if !active.insert(identity.to_string()) {
            return Err(Busy {
                identity: identity.to_string(),
            });
        }
        Ok(AdmissionGuard {
            control: Arc::clone(self),
            identity: identity.to_string(),
        })
    }

    pub fn is_active(&self, identity: &str) -> bool {
        self.lock().contains(identity)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, identity: &str) {
        self.lock().remove(identity);
    }

    // A panic while holding this lock cannot leave the set half-updated.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct AdmissionGuard {
    control: Arc<AdmissionControl>,
    identity: String,
}

impl AdmissionGuard {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.control.release(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use std::panic;
    use std::thread;

    use super::AdmissionControl;

    #[test]
    fn second_acquire_for_same_identity_is_busy() {
        let control = AdmissionControl::new();
        let _guard = control.try_acquire("u-1").unwrap();
        let err = control.try_acquire("u-1").unwrap_err();
        assert_eq!(err.identity, "u-1");
        assert_eq!(control.active_count(), 1);
    }

    #[test]
    fn different_identities_run_concurrently() {
        let control = AdmissionControl::new();
        let _a = control.try_acquire("u-1").unwrap();
        let _b = control.try_acquire("u-2").unwrap();
        assert_eq!(control.active_count(), 2);
    }

    #[test]
    fn dropping_guard_releases_identity() {
        let control = AdmissionControl::new();
        {
            let guard = control.try_acquire("u-1").unwrap();
            assert_eq!(guard.identity(), "u-1");
            assert!(control.is_active("u-1"));
        }
        assert!(!control.is_active("u-1"));
        assert!(control.try_acquire("u-1").is_ok());
    }

    #[test]
    fn error_path_releases_identity() {
        fn failing_request(control: &std::sync::Arc<AdmissionControl>) -> anyhow::Result<()> {
            let _guard = control.try_acquire("u-1")?;
            anyhow::bail!("backend exploded")
        }
        let control = AdmissionControl::new();
        assert!(failing_request(&control).is_err());
        assert!(!control.is_active("u-1"));
    }

    #[test]
    fn panic_on_worker_thread_releases_identity() {
        let control = AdmissionControl::new();
        let worker_control = control.clone();
        let result = thread::spawn(move || {
            let _guard = worker_control.try_acquire("u-1").unwrap();
            panic::panic_any("stream decoder panicked");
        })
        .join();
        assert!(result.is_err());
        assert!(!control.is_active("u-1"));
    }
}
