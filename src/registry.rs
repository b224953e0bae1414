//! Process-wide connection accounting.
//!
//! Admission and release both run under a single lock, so a check can never be
//! separated from its increment. A successful admission hands out a
//! [`ConnectionLease`]; dropping the lease is the only way to release a slot,
//! which makes teardown exactly-once per pair regardless of which leg closes first.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("global connection limit reached ({0})")]
    Global(usize),
    #[error("per-IP connection limit reached ({0})")]
    PerIp(usize),
}

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    per_ip: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct Registry {
    limits: Limits,
    counts: Mutex<Counts>,
    live: watch::Sender<usize>,
}

impl Registry {
    pub fn new(limits: Limits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            counts: Mutex::new(Counts::default()),
            live: watch::Sender::new(0),
        })
    }

    /// Checks both ceilings and, if they pass, takes a slot for `ip`.
    pub fn try_admit(self: &Arc<Self>, ip: &str) -> Result<ConnectionLease, CapacityError> {
        let mut counts = self.lock();
        self.check(&counts, ip)?;

        counts.total += 1;
        *counts.per_ip.entry(ip.to_string()).or_insert(0) += 1;
        self.live.send_replace(counts.total);
        drop(counts);

        Ok(ConnectionLease {
            registry: Arc::clone(self),
            ip: ip.to_string(),
        })
    }

    /// Same checks as [`Registry::try_admit`] without taking a slot.
    pub fn check_capacity(&self, ip: &str) -> Result<(), CapacityError> {
        self.check(&self.lock(), ip)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().total
    }

    pub fn connections_from(&self, ip: &str) -> usize {
        self.lock().per_ip.get(ip).copied().unwrap_or(0)
    }

    pub fn tracked_ips(&self) -> usize {
        self.lock().per_ip.len()
    }

    /// Resolves once no lease is outstanding.
    pub async fn wait_idle(&self) {
        let mut live = self.live.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = live.wait_for(|count| *count == 0).await;
    }

    fn check(&self, counts: &Counts, ip: &str) -> Result<(), CapacityError> {
        if counts.total >= self.limits.max_connections {
            return Err(CapacityError::Global(self.limits.max_connections));
        }
        let from_ip = counts.per_ip.get(ip).copied().unwrap_or(0);
        if from_ip >= self.limits.max_connections_per_ip {
            return Err(CapacityError::PerIp(self.limits.max_connections_per_ip));
        }
        Ok(())
    }

    fn release(&self, ip: &str) {
        let mut counts = self.lock();
        counts.total = counts.total.saturating_sub(1);
        if let Some(count) = counts.per_ip.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.per_ip.remove(ip);
            }
        }
        self.live.send_replace(counts.total);
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One admitted connection's slot. Released on drop.
#[derive(Debug)]
pub struct ConnectionLease {
    registry: Arc<Registry>,
    ip: String,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.registry.release(&self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Barrier, thread, time::Duration};

    fn registry(max_connections: usize, max_connections_per_ip: usize) -> Arc<Registry> {
        Registry::new(Limits {
            max_connections,
            max_connections_per_ip,
        })
    }

    #[test]
    fn admits_until_per_ip_limit() {
        let registry = registry(10, 2);
        let first = registry.try_admit("203.0.113.7").unwrap();
        let _second = registry.try_admit("203.0.113.7").unwrap();
        assert_eq!(
            registry.try_admit("203.0.113.7").unwrap_err(),
            CapacityError::PerIp(2)
        );
        let _other = registry.try_admit("198.51.100.1").unwrap();

        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.connections_from("203.0.113.7"), 2);

        drop(first);
        assert_eq!(registry.connections_from("203.0.113.7"), 1);
        assert!(registry.try_admit("203.0.113.7").is_ok());
    }

    #[test]
    fn global_limit_is_checked_first() {
        let registry = registry(1, 1);
        let _lease = registry.try_admit("203.0.113.7").unwrap();
        assert_eq!(
            registry.try_admit("203.0.113.7").unwrap_err(),
            CapacityError::Global(1)
        );
        assert_eq!(
            registry.check_capacity("198.51.100.1").unwrap_err(),
            CapacityError::Global(1)
        );
    }

    #[test]
    fn rejected_admission_has_no_side_effect() {
        let registry = registry(5, 1);
        let _lease = registry.try_admit("203.0.113.7").unwrap();
        assert!(registry.try_admit("203.0.113.7").is_err());
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.connections_from("203.0.113.7"), 1);
    }

    #[test]
    fn per_ip_entries_are_removed_at_zero() {
        let registry = registry(5, 5);
        let a = registry.try_admit("203.0.113.7").unwrap();
        let b = registry.try_admit("198.51.100.1").unwrap();
        assert_eq!(registry.tracked_ips(), 2);
        drop(a);
        drop(b);
        assert_eq!(registry.tracked_ips(), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn concurrent_admissions_respect_per_ip_limit() {
        const ATTEMPTS: usize = 32;
        const PER_IP: usize = 5;

        let registry = registry(1000, PER_IP);
        let barrier = Arc::new(Barrier::new(ATTEMPTS));

        let handles: Vec<_> = (0..ATTEMPTS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.try_admit("203.0.113.7")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(CapacityError::PerIp(_))))
            .count();

        assert_eq!(admitted, PER_IP);
        assert_eq!(rejected, ATTEMPTS - PER_IP);
        assert_eq!(registry.connections_from("203.0.113.7"), PER_IP);
    }

    #[test]
    fn concurrent_admissions_respect_global_limit() {
        let registry = registry(2, 5);
        let barrier = Arc::new(Barrier::new(3));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.try_admit("203.0.113.7")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(CapacityError::Global(2))))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_last_release() {
        let registry = registry(5, 5);
        let lease = registry.try_admit("203.0.113.7").unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
