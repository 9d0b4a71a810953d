use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use quorum_core::{Provisioner, SessionError, WorkerUnit};

/// Fixed roster of workers started outside this process.
///
/// Seeds the pool from configuration. It cannot start anything new, so
/// `create` always fails.
pub struct StaticProvisioner {
    roster: Mutex<Vec<WorkerUnit>>,
}

impl StaticProvisioner {
    pub fn new(roster: Vec<WorkerUnit>) -> Self {
        Self {
            roster: Mutex::new(roster),
        }
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn list_running(&self) -> Result<Vec<WorkerUnit>, SessionError> {
        Ok(self.roster.lock().clone())
    }

    async fn create(&self, n: usize) -> Result<Vec<WorkerUnit>, SessionError> {
        warn!(requested = n, "static roster cannot start new workers");
        Err(SessionError::Provisioning(format!(
            "static roster cannot start {n} new workers"
        )))
    }

    async fn terminate(&self, unit: &WorkerUnit) -> Result<(), SessionError> {
        let mut roster = self.roster.lock();
        let before = roster.len();
        roster.retain(|u| u.name != unit.name);
        if roster.len() == before {
            return Err(SessionError::Provisioning(format!(
                "worker {} is not in the roster",
                unit.name
            )));
        }
        info!(worker = %unit.name, "worker removed from roster");
        Ok(())
    }
}

/// In-memory provisioner that "starts" units instantly.
#[derive(Default)]
pub struct MockProvisioner {
    running: Mutex<Vec<WorkerUnit>>,
    next: AtomicUsize,
    creates: AtomicUsize,
    fail_create: bool,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create` call fails.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> Vec<WorkerUnit> {
        self.running.lock().clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn list_running(&self) -> Result<Vec<WorkerUnit>, SessionError> {
        Ok(self.running())
    }

    async fn create(&self, n: usize) -> Result<Vec<WorkerUnit>, SessionError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(SessionError::Provisioning("mock provisioner refused".into()));
        }
        let units: Vec<WorkerUnit> = (0..n)
            .map(|_| {
                let i = self.next.fetch_add(1, Ordering::SeqCst) + 1;
                WorkerUnit::new(format!("mock-{i}"), format!("127.0.0.1:{}", 19000 + i))
            })
            .collect();
        self.running.lock().extend(units.iter().cloned());
        Ok(units)
    }

    async fn terminate(&self, unit: &WorkerUnit) -> Result<(), SessionError> {
        self.running.lock().retain(|u| u.name != unit.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_roster_lists_and_terminates() {
        let p = StaticProvisioner::new(vec![
            WorkerUnit::new("a", "127.0.0.1:1"),
            WorkerUnit::new("b", "127.0.0.1:2"),
        ]);
        assert_eq!(p.list_running().await.unwrap().len(), 2);

        p.terminate(&WorkerUnit::new("a", "127.0.0.1:1")).await.unwrap();
        let names: Vec<_> = p.list_running().await.unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, ["b"]);

        let err = p.terminate(&WorkerUnit::new("zz", "")).await.unwrap_err();
        assert!(matches!(err, SessionError::Provisioning(_)));
    }

    #[tokio::test]
    async fn static_roster_cannot_create() {
        let p = StaticProvisioner::new(Vec::new());
        assert!(matches!(p.create(1).await, Err(SessionError::Provisioning(_))));
    }

    #[tokio::test]
    async fn mock_creates_unique_units() {
        let p = MockProvisioner::new();
        let first = p.create(2).await.unwrap();
        let second = p.create(1).await.unwrap();
        assert_eq!(first[0].name, "mock-1");
        assert_eq!(second[0].name, "mock-3");
        assert_eq!(p.list_running().await.unwrap().len(), 3);
        assert_eq!(p.create_calls(), 2);

        p.terminate(&first[0]).await.unwrap();
        assert_eq!(p.running().len(), 2);
    }
}
