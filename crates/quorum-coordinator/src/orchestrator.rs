//! Session orchestrator: one keygen or signing run from worker allocation
//! to aggregated result.
//!
//! Each session leases `N` workers, registers one party per worker, runs a
//! [`RoundDriver`] per party and waits on a join barrier. The first concrete
//! failure cancels every sibling. Workers are released and the registry is
//! cleared on every exit path.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use quorum_core::{
    EngineFactory, PartyId, PartySet, ProtocolKind, ProtocolOutput, ProtocolParams, Provisioner,
    SessionError, SessionId, WorkerUnit,
};
use quorum_telemetry::MetricsRecorder;

use crate::driver::{DriverConfig, DriverReport, RoundDriver};
use crate::pool::{WorkerLease, WorkerPool};
use crate::registry::PartyRegistry;
use crate::router::MessageRouter;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Upper bound for the whole protocol run, allocation excluded.
    pub session_timeout: Duration,
    pub max_parties: u16,
    /// Ask the provisioner for more workers when the pool is short.
    pub auto_provision: bool,
    /// Idle units to keep when tearing down provisioned surplus.
    pub min_idle: usize,
    pub driver: DriverConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(60),
            max_parties: 16,
            auto_provision: false,
            min_idle: 0,
            driver: DriverConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignRequest {
    pub parties: u16,
    pub key_share: Bytes,
    pub message: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeygenResult {
    pub session_id: SessionId,
    pub public_key: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignResult {
    pub session_id: SessionId,
    pub r: Bytes,
    pub s: Bytes,
}

/// A session that has not finished yet.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub kind: &'static str,
    pub threshold: u16,
    pub total: u16,
    pub started_at: DateTime<Utc>,
}

struct ActiveSession {
    cancel: CancellationToken,
    info: SessionInfo,
}

/// Removes the session from the active map however `run_session` exits.
struct ActiveGuard<'a> {
    orchestrator: &'a SessionOrchestrator,
    session_id: SessionId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.active.remove(&self.session_id);
        self.orchestrator.publish_active();
    }
}

/// Unregisters the session's parties on drop. Declared before the worker
/// lease so workers are released first.
struct Registration<'a> {
    registry: &'a PartyRegistry,
    session_id: &'a SessionId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister_session(self.session_id);
    }
}

/// Running drivers of one session.
///
/// If the session future is dropped before the join barrier drains the set,
/// the drivers are cancelled and detached rather than aborted, so each still
/// shuts its engine down and ends `Cancelled`.
struct DriverSet {
    tasks: JoinSet<DriverReport>,
    cancel: CancellationToken,
}

impl Drop for DriverSet {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            warn!(drivers = self.tasks.len(), "session dropped while drivers were running");
            self.cancel.cancel();
            self.tasks.detach_all();
        }
    }
}

pub struct SessionOrchestrator {
    pool: Arc<WorkerPool>,
    registry: Arc<PartyRegistry>,
    router: Arc<MessageRouter>,
    engines: Arc<dyn EngineFactory>,
    provisioner: Option<Arc<dyn Provisioner>>,
    config: OrchestratorConfig,
    active: DashMap<SessionId, ActiveSession>,
    /// Units this orchestrator asked the provisioner for.
    provisioned: Mutex<BTreeSet<String>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionOrchestrator {
    pub fn new(
        pool: Arc<WorkerPool>,
        registry: Arc<PartyRegistry>,
        router: Arc<MessageRouter>,
        engines: Arc<dyn EngineFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            router,
            engines,
            provisioner: None,
            config,
            active: DashMap::new(),
            provisioned: Mutex::new(BTreeSet::new()),
            metrics: None,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<PartyRegistry> {
        &self.registry
    }

    /// Distributed key generation across `total` fresh parties.
    pub async fn keygen(&self, threshold: u16, total: u16) -> Result<KeygenResult, SessionError> {
        self.validate(threshold, total)?;
        let (session_id, output) = self
            .run_session(ProtocolKind::Keygen, threshold, total)
            .await?;
        match output {
            ProtocolOutput::PublicKey(public_key) => Ok(KeygenResult {
                session_id,
                public_key,
            }),
            other => Err(SessionError::Internal(format!(
                "keygen produced {other:?} instead of a public key"
            ))),
        }
    }

    /// Threshold signing of `message`. Every party signs, so `T = N - 1`.
    pub async fn sign(&self, request: SignRequest) -> Result<SignResult, SessionError> {
        if request.message.is_empty() {
            return Err(SessionError::InvalidParameters("message must not be empty".into()));
        }
        if request.key_share.is_empty() {
            return Err(SessionError::InvalidParameters("key share must not be empty".into()));
        }
        let threshold = request.parties.saturating_sub(1);
        self.validate(threshold, request.parties)?;

        let kind = ProtocolKind::Sign {
            key_share: request.key_share,
            message: request.message,
        };
        let (session_id, output) = self.run_session(kind, threshold, request.parties).await?;
        match output {
            ProtocolOutput::Signature { r, s } => Ok(SignResult { session_id, r, s }),
            other => Err(SessionError::Internal(format!(
                "sign produced {other:?} instead of a signature"
            ))),
        }
    }

    /// Cancel a running session. Its caller receives `Cancelled`.
    pub fn abort(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let active = self
            .active
            .get(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        info!(session_id = %session_id, "aborting session");
        active.cancel.cancel();
        Ok(())
    }

    /// Cancel every running session, e.g. on shutdown.
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for entry in self.active.iter() {
            entry.cancel.cancel();
            count += 1;
        }
        if count > 0 {
            info!(count, "aborted all sessions");
        }
        count
    }

    /// Take a worker out of service and tear it down through the provisioner.
    /// A unit held by a running session leaves the pool when that session releases it.
    pub async fn retire_worker(&self, name: &str) -> Result<WorkerUnit, SessionError> {
        let unit = self
            .pool
            .get(name)
            .ok_or_else(|| SessionError::UnknownWorker(name.to_string()))?;
        self.pool.retire(name);
        self.provisioned.lock().remove(name);
        if let Some(provisioner) = &self.provisioner {
            provisioner.terminate(&unit).await?;
        }
        info!(worker = name, "worker retired");
        Ok(unit)
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.active.iter().map(|e| e.info.clone()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    fn validate(&self, threshold: u16, total: u16) -> Result<(), SessionError> {
        if total < 2 {
            return Err(SessionError::InvalidParameters(format!(
                "at least 2 parties required, got {total}"
            )));
        }
        if total > self.config.max_parties {
            return Err(SessionError::InvalidParameters(format!(
                "{total} parties exceeds the limit of {}",
                self.config.max_parties
            )));
        }
        if threshold < 1 || threshold >= total {
            return Err(SessionError::InvalidParameters(format!(
                "threshold must satisfy 1 <= t < n, got t={threshold} n={total}"
            )));
        }
        Ok(())
    }

    async fn run_session(
        &self,
        kind: ProtocolKind,
        threshold: u16,
        total: u16,
    ) -> Result<(SessionId, ProtocolOutput), SessionError> {
        let session_id = SessionId::new();
        let cancel = CancellationToken::new();
        let kind_label = kind.as_str();
        let started = Instant::now();

        self.active.insert(
            session_id.clone(),
            ActiveSession {
                cancel: cancel.clone(),
                info: SessionInfo {
                    session_id: session_id.clone(),
                    kind: kind_label,
                    threshold,
                    total,
                    started_at: Utc::now(),
                },
            },
        );
        self.publish_active();
        let _active = ActiveGuard {
            orchestrator: self,
            session_id: session_id.clone(),
        };

        let result = self
            .execute(&session_id, kind, threshold, total, &cancel)
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(session_id = %session_id, kind = kind_label, elapsed_ms, "session succeeded"),
            Err(err) => warn!(
                session_id = %session_id,
                kind = kind_label,
                elapsed_ms,
                error = %err,
                error_kind = err.error_kind(),
                "session failed"
            ),
        }
        if let Some(m) = &self.metrics {
            let outcome = result.as_ref().map_or_else(|e| e.error_kind(), |_| "ok");
            m.counter_inc("sessions.total", &[("kind", kind_label), ("outcome", outcome)], 1);
            m.histogram_observe("session.duration_ms", &[("kind", kind_label)], elapsed_ms as f64);
        }

        if self.config.auto_provision {
            self.trim_provisioned().await;
        }
        result.map(|output| (session_id, output))
    }

    /// Terminate idle provisioned units above `min_idle`.
    async fn trim_provisioned(&self) {
        let Some(provisioner) = &self.provisioner else { return };
        let names: Vec<String> = self.provisioned.lock().iter().cloned().collect();
        for name in names {
            if self.pool.idle_count() <= self.config.min_idle {
                break;
            }
            let Some(unit) = self.pool.take_idle(&name) else { continue };
            self.provisioned.lock().remove(&name);
            match provisioner.terminate(&unit).await {
                Ok(()) => info!(worker = %unit.name, "surplus worker terminated"),
                Err(e) => warn!(worker = %unit.name, error = %e, "failed to terminate surplus worker"),
            }
        }
    }

    #[instrument(skip(self, session_id, kind, cancel), fields(session_id = %session_id, kind = kind.as_str()))]
    async fn execute(
        &self,
        session_id: &SessionId,
        kind: ProtocolKind,
        threshold: u16,
        total: u16,
        cancel: &CancellationToken,
    ) -> Result<ProtocolOutput, SessionError> {
        let _registration = Registration {
            registry: &self.registry,
            session_id,
        };

        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            lease = self.acquire(total as usize) => lease?,
        };
        let parties = PartySet::from_workers(session_id.clone(), lease.units())?;

        // Every inbox exists before any engine can emit a message.
        let mut inboxes = Vec::with_capacity(parties.len());
        for party in parties.iter() {
            inboxes.push(self.registry.register(session_id, party.clone())?);
        }

        let mut drivers = DriverSet {
            tasks: JoinSet::new(),
            cancel: cancel.clone(),
        };
        for (party, inbox) in parties.iter().zip(inboxes) {
            let params = ProtocolParams {
                session_id: session_id.clone(),
                kind: kind.clone(),
                threshold,
                parties: parties.clone(),
                local: party.clone(),
            };
            let driver = RoundDriver::new(
                params,
                self.engines.create(party),
                Arc::clone(&self.router),
                inbox,
                self.config.driver.clone(),
            );
            drivers.tasks.spawn(driver.run(cancel.clone()));
        }
        info!(parties = parties.len(), threshold, "session started");

        let outputs = self.join(&mut drivers.tasks, cancel).await;
        drop(lease);
        check_agreement(outputs?)
    }

    async fn acquire(&self, count: usize) -> Result<WorkerLease, SessionError> {
        if let (true, Some(provisioner)) = (self.config.auto_provision, &self.provisioner) {
            if let Some(lease) = self.pool.try_lease(count) {
                return Ok(lease);
            }
            let deficit = count.saturating_sub(self.pool.idle_count());
            info!(deficit, "pool short, provisioning workers");
            match provisioner.create(deficit).await {
                Ok(units) => {
                    let mut provisioned = self.provisioned.lock();
                    for unit in units {
                        provisioned.insert(unit.name.clone());
                        self.pool.add_existing(unit);
                    }
                }
                // Units may still come back to the pool within the usual wait.
                Err(e) => warn!(deficit, error = %e, "provisioning failed, waiting on the pool"),
            }
        }
        self.pool.lease(count).await
    }

    /// Wait for every driver. The first concrete error wins and cancels the rest.
    async fn join(
        &self,
        drivers: &mut JoinSet<DriverReport>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(PartyId, u16, ProtocolOutput)>, SessionError> {
        let deadline = tokio::time::sleep(self.config.session_timeout);
        tokio::pin!(deadline);

        let mut first: Option<SessionError> = None;
        let mut outputs = Vec::with_capacity(drivers.len());

        loop {
            let joined = tokio::select! {
                biased;
                joined = drivers.join_next() => joined,
                _ = &mut deadline, if first.is_none() => {
                    warn!(timeout_ms = self.config.session_timeout.as_millis() as u64, "session timed out");
                    first = Some(SessionError::Timeout(self.config.session_timeout));
                    cancel.cancel();
                    continue;
                }
            };
            let Some(joined) = joined else { break };

            let err = match joined {
                Ok(report) => match report.result {
                    Ok(output) => {
                        outputs.push((report.party_id, report.index, output));
                        continue;
                    }
                    Err(err) => err,
                },
                Err(join_err) => SessionError::Internal(format!("round driver task failed: {join_err}")),
            };

            let replace = match &first {
                None => true,
                Some(prev) => prev.is_derivative() && !err.is_derivative(),
            };
            if replace {
                first = Some(err);
            }
            cancel.cancel();
        }

        match first {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }

    fn publish_active(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set("sessions.active", &[], self.active.len() as f64);
        }
    }
}

fn check_agreement(mut outputs: Vec<(PartyId, u16, ProtocolOutput)>) -> Result<ProtocolOutput, SessionError> {
    outputs.sort_by_key(|(_, index, _)| *index);
    let mut iter = outputs.into_iter();
    let Some((_, _, expected)) = iter.next() else {
        return Err(SessionError::Internal("session finished without any party output".into()));
    };
    for (party_id, index, output) in iter {
        if output != expected {
            error!(party_id = %party_id, index, "parties disagree on session output");
            return Err(SessionError::ResultMismatch(format!(
                "party {party_id} (index {index}) disagrees with party index 1"
            )));
        }
    }
    Ok(expected)
}
