//! Admission control for task cycles
//!
//! The gate is a counting permit pool sized to the executor thread count. A
//! cycle must hold a permit before it polls, so the number of leased but
//! unfinished tasks never exceeds the number of threads able to run them.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Non-blocking permit pool shared by every worker of a runner
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Exclusive right to run one task cycle
///
/// Returned to the gate exactly once, on [`Permit::release`] or drop.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

impl Permit {
    /// Return the permit to its gate
    pub fn release(self) {}
}

impl AdmissionGate {
    /// Create a gate with `capacity` permits
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a permit if one is free; never waits
    ///
    /// Returns `None` when every permit is out or the gate is closed.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|inner| Permit { _inner: inner })
    }

    /// Free permits right now; a snapshot for diagnostics
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Total permits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available_permits())
    }

    /// Refuse further acquisitions; held permits stay valid
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let gate = AdmissionGate::new(2);

        let first = gate.try_acquire().expect("first permit");
        let second = gate.try_acquire().expect("second permit");
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.available_permits(), 0);
        assert_eq!(gate.in_flight(), 2);

        first.release();
        assert_eq!(gate.available_permits(), 1);

        drop(second);
        assert_eq!(gate.available_permits(), 2);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_clones_share_permits() {
        let gate = AdmissionGate::new(1);
        let other = gate.clone();

        let permit = gate.try_acquire().unwrap();
        assert!(other.try_acquire().is_none());
        permit.release();
        assert!(other.try_acquire().is_some());
        assert_eq!(other.capacity(), 1);
    }

    #[test]
    fn test_closed_gate_denies() {
        let gate = AdmissionGate::new(2);
        let held = gate.try_acquire().unwrap();

        gate.close();
        assert!(gate.is_closed());
        assert!(gate.try_acquire().is_none());

        held.release();
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_acquisition_never_exceeds_capacity() {
        let gate = AdmissionGate::new(3);
        let mut handles = Vec::new();

        for _ in 0..32 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                match gate.try_acquire() {
                    Some(permit) => {
                        assert!(gate.in_flight() <= 3);
                        tokio::task::yield_now().await;
                        permit.release();
                        true
                    }
                    None => false,
                }
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert!(granted >= 1);
        assert_eq!(gate.available_permits(), 3);
    }
}
