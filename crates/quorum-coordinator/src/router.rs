use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quorum_core::{MessageEnvelope, Party, PartyId, SessionError, SessionId, Transport, TransportError};
use quorum_telemetry::MetricsRecorder;

use crate::registry::PartyRegistry;

/// Delivery retry policy.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Total attempts per destination, including the first. Clamped to 1..=3.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
    /// Bound on a single transport call.
    pub call_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Delivers envelopes to the registered parties of a session over a [`Transport`].
pub struct MessageRouter {
    registry: Arc<PartyRegistry>,
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl MessageRouter {
    pub fn new(registry: Arc<PartyRegistry>, transport: Arc<dyn Transport>, config: RouterConfig) -> Self {
        Self {
            registry,
            transport,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.clamp(1, 3)
    }

    /// Destinations of an envelope, in increasing ordinal order.
    ///
    /// Fails fast on a malformed envelope or on a sender or recipient that is
    /// not registered in the session.
    pub fn resolve(&self, envelope: &MessageEnvelope) -> Result<Vec<Party>, SessionError> {
        envelope.validate()?;
        let session_id = envelope.session_id();
        self.registry.lookup(session_id, envelope.from())?;

        match envelope.recipient() {
            None => self.registry.peers(session_id, envelope.from()),
            Some(to) => Ok(vec![self.registry.lookup(session_id, to)?]),
        }
    }

    /// Deliver to one destination, retrying retryable failures with a fixed backoff.
    pub async fn deliver(&self, to: &Party, envelope: &MessageEnvelope) -> Result<(), SessionError> {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(
                self.config.call_timeout,
                self.transport.call_party(&to.address, &to.id, envelope),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.config.call_timeout)),
            };

            let err = match outcome {
                Ok(()) => {
                    self.count("router.deliveries.total");
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                warn!(
                    session_id = %envelope.session_id(),
                    from = %envelope.from(),
                    to = %to.id,
                    attempt,
                    error = %err,
                    "delivery failed"
                );
                self.count("router.failures.total");
                return Err(SessionError::DeliveryFailed {
                    from: envelope.from().clone(),
                    to: to.id.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            warn!(
                to = %to.id,
                attempt,
                max_attempts,
                delay_ms = self.config.backoff.as_millis() as u64,
                error = %err,
                "retrying delivery after error"
            );
            self.count("router.retries.total");
            tokio::time::sleep(self.config.backoff).await;
        }
    }

    /// Route one envelope and wait for every delivery. Returns the number of
    /// destinations reached: N-1 for a broadcast, 1 for point-to-point.
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<usize, SessionError> {
        let targets = self.resolve(envelope)?;
        // join_all polls in order, so calls start in ordinal order.
        let results = join_all(targets.iter().map(|to| self.deliver(to, envelope))).await;
        for result in results {
            result?;
        }
        Ok(targets.len())
    }

    /// Open a sender-side outbox with one ordered lane per destination.
    ///
    /// Lanes deliver in the background, so a slow peer only delays its own
    /// lane. Terminal delivery failures are reported on `failures`.
    pub fn open_outbox(
        self: &Arc<Self>,
        session_id: SessionId,
        sender: PartyId,
        cancel: CancellationToken,
        failures: mpsc::UnboundedSender<SessionError>,
    ) -> Outbox {
        Outbox {
            router: Arc::clone(self),
            session_id,
            sender,
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
            cancel,
            failures,
        }
    }

    fn count(&self, name: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, &[], 1);
        }
    }
}

/// Per-sender delivery queues. Messages from this sender to any one
/// destination are delivered in submission order.
pub struct Outbox {
    router: Arc<MessageRouter>,
    session_id: SessionId,
    sender: PartyId,
    lanes: HashMap<PartyId, mpsc::UnboundedSender<MessageEnvelope>>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<SessionError>,
}

impl Outbox {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn sender(&self) -> &PartyId {
        &self.sender
    }

    /// Resolve and enqueue without waiting for delivery.
    pub fn submit(&mut self, envelope: MessageEnvelope) -> Result<usize, SessionError> {
        if envelope.from() != &self.sender || envelope.session_id() != &self.session_id {
            return Err(SessionError::InvalidEnvelope(format!(
                "outbox of {} cannot send on behalf of {}",
                self.sender,
                envelope.from()
            )));
        }
        let targets = self.router.resolve(&envelope)?;
        for to in &targets {
            let lane = match self.lanes.get(&to.id) {
                Some(lane) => lane.clone(),
                None => self.open_lane(to.clone()),
            };
            if lane.send(envelope.clone()).is_err() {
                debug!(to = %to.id, "lane closed, message not queued");
            }
        }
        Ok(targets.len())
    }

    /// Forward a failure detected outside the lanes to the same channel.
    pub fn report_failure(&self, err: SessionError) {
        let _ = self.failures.send(err);
    }

    /// Stop accepting messages and wait for every lane to drain.
    pub async fn flush(mut self) {
        self.lanes.clear();
        while self.tasks.join_next().await.is_some() {}
    }

    fn open_lane(&mut self, to: Party) -> mpsc::UnboundedSender<MessageEnvelope> {
        let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
        let to_id = to.id.clone();
        let router = Arc::clone(&self.router);
        let cancel = self.cancel.clone();
        let failures = self.failures.clone();

        self.tasks.spawn(async move {
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => return,
                    },
                };
                let delivered = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    result = router.deliver(&to, &envelope) => result,
                };
                if let Err(err) = delivered {
                    let _ = failures.send(err);
                    return;
                }
            }
        });

        self.lanes.insert(to_id, tx.clone());
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quorum_core::{PartySeed, PartySet};
    use quorum_transport::MockTransport;

    struct Fixture {
        registry: Arc<PartyRegistry>,
        transport: Arc<MockTransport>,
        router: Arc<MessageRouter>,
        session_id: SessionId,
        _inboxes: Vec<crate::registry::Inbox>,
    }

    fn fixture(n: usize) -> Fixture {
        fixture_with(n, RouterConfig {
            backoff: Duration::from_millis(1),
            ..Default::default()
        })
    }

    fn fixture_with(n: usize, config: RouterConfig) -> Fixture {
        let registry = Arc::new(PartyRegistry::new());
        let session_id = SessionId::new();
        let seeds = (1..=n)
            .map(|i| PartySeed {
                id: PartyId::from_raw(format!("p{i}")),
                label: format!("p{i}"),
                address: format!("10.0.0.{i}:9000"),
            })
            .collect();
        let set = PartySet::new(session_id.clone(), seeds).unwrap();
        let inboxes = set
            .iter()
            .map(|p| registry.register(&session_id, p.clone()).unwrap())
            .collect();

        let transport = Arc::new(MockTransport::new());
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            transport.clone() as Arc<dyn Transport>,
            config,
        ));
        Fixture {
            registry,
            transport,
            router,
            session_id,
            _inboxes: inboxes,
        }
    }

    fn pid(s: &str) -> PartyId {
        PartyId::from_raw(s)
    }

    #[tokio::test]
    async fn broadcast_makes_n_minus_one_calls() {
        for n in 2..=6 {
            let f = fixture(n);
            let env = MessageEnvelope::broadcast(f.session_id.clone(), pid("p2"), Bytes::from_static(b"r1"));
            assert_eq!(f.router.send(&env).await.unwrap(), n - 1);

            let calls = f.transport.calls();
            assert_eq!(calls.len(), n - 1);
            assert!(calls.iter().all(|c| c.recipient != pid("p2")));
        }
    }

    #[tokio::test]
    async fn broadcast_starts_in_ordinal_order() {
        let f = fixture(4);
        let env = MessageEnvelope::broadcast(f.session_id.clone(), pid("p3"), Bytes::new());
        f.router.send(&env).await.unwrap();
        let order: Vec<String> = f.transport.calls().iter().map(|c| c.recipient.to_string()).collect();
        assert_eq!(order, ["p1", "p2", "p4"]);
    }

    #[tokio::test]
    async fn point_to_point_makes_one_call() {
        let f = fixture(3);
        let env = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("p3"), Bytes::new());
        assert_eq!(f.router.send(&env).await.unwrap(), 1);
        let calls = f.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].address, "10.0.0.3:9000");
    }

    #[tokio::test]
    async fn empty_recipient_never_broadcasts() {
        let f = fixture(3);
        let env = MessageEnvelope::from_parts(f.session_id.clone(), pid("p1"), vec![], false, Bytes::new());
        let err = f.router.send(&env).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidEnvelope(_)), "got: {err}");
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_recipient_or_sender_fails_fast() {
        let f = fixture(3);
        let to_ghost = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("ghost"), Bytes::new());
        assert!(matches!(
            f.router.send(&to_ghost).await,
            Err(SessionError::UnknownParty { party_id, .. }) if party_id == pid("ghost")
        ));

        let from_ghost = MessageEnvelope::broadcast(f.session_id.clone(), pid("ghost"), Bytes::new());
        assert!(matches!(f.router.send(&from_ghost).await, Err(SessionError::UnknownParty { .. })));
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let f = fixture(2);
        f.transport.fail_next(&pid("p2"), TransportError::Connect("refused".into()), 2);
        let env = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("p2"), Bytes::new());
        f.router.send(&env).await.unwrap();
        assert_eq!(f.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_delivery_failed() {
        let f = fixture(3);
        f.transport.make_unreachable(&pid("p3"));
        let env = MessageEnvelope::broadcast(f.session_id.clone(), pid("p1"), Bytes::new());
        let err = f.router.send(&env).await.unwrap_err();
        match err {
            SessionError::DeliveryFailed { from, to, attempts, .. } => {
                assert_eq!(from, pid("p1"));
                assert_eq!(to, pid("p3"));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.transport.calls_to(&pid("p3")).len(), 3);
        assert_eq!(f.transport.calls_to(&pid("p2")).len(), 1);
    }

    #[tokio::test]
    async fn attempts_are_capped_at_three() {
        let f = fixture_with(2, RouterConfig {
            max_attempts: 10,
            backoff: Duration::from_millis(1),
            ..Default::default()
        });
        f.transport.make_unreachable(&pid("p2"));
        let env = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("p2"), Bytes::new());
        assert!(f.router.send(&env).await.is_err());
        assert_eq!(f.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_not_retried() {
        let f = fixture(2);
        f.transport.fail_next(
            &pid("p2"),
            TransportError::Rejected { status: 404, body: "gone".into() },
            1,
        );
        let env = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("p2"), Bytes::new());
        assert!(matches!(
            f.router.send(&env).await,
            Err(SessionError::DeliveryFailed { attempts: 1, .. })
        ));
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn slow_call_times_out_and_retries() {
        let f = fixture_with(2, RouterConfig {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
            call_timeout: Duration::from_millis(20),
        });
        f.transport.delay_for(&pid("p2"), Duration::from_millis(200));
        let env = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("p2"), Bytes::new());
        let err = f.router.send(&env).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::DeliveryFailed { source: TransportError::Timeout(_), attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn outbox_lanes_preserve_per_destination_order() {
        let f = fixture(3);
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let mut outbox = f.router.open_outbox(f.session_id.clone(), pid("p1"), CancellationToken::new(), fail_tx);

        // p2 is slow; p3 must not wait for it.
        f.transport.delay_for(&pid("p2"), Duration::from_millis(5));
        for i in 0..10u8 {
            let env = MessageEnvelope::broadcast(f.session_id.clone(), pid("p1"), Bytes::from(vec![i]));
            assert_eq!(outbox.submit(env).unwrap(), 2);
        }
        outbox.flush().await;

        for peer in ["p2", "p3"] {
            let payloads: Vec<u8> = f
                .transport
                .calls_to(&pid(peer))
                .iter()
                .map(|c| c.envelope.payload()[0])
                .collect();
            assert_eq!(payloads, (0..10).collect::<Vec<u8>>(), "order to {peer}");
        }
        assert!(fail_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outbox_reports_lane_failure() {
        let f = fixture(3);
        f.transport.make_unreachable(&pid("p3"));
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let mut outbox = f.router.open_outbox(f.session_id.clone(), pid("p1"), CancellationToken::new(), fail_tx);

        let env = MessageEnvelope::broadcast(f.session_id.clone(), pid("p1"), Bytes::new());
        outbox.submit(env).unwrap();

        let err = fail_rx.recv().await.unwrap();
        assert!(matches!(err, SessionError::DeliveryFailed { ref to, .. } if to == &pid("p3")));
        outbox.flush().await;
    }

    #[tokio::test]
    async fn outbox_rejects_foreign_sender() {
        let f = fixture(2);
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let mut outbox = f.router.open_outbox(f.session_id.clone(), pid("p1"), CancellationToken::new(), fail_tx);
        let env = MessageEnvelope::broadcast(f.session_id.clone(), pid("p2"), Bytes::new());
        assert!(matches!(outbox.submit(env), Err(SessionError::InvalidEnvelope(_))));
    }

    #[tokio::test]
    async fn cancelled_outbox_stops_delivering() {
        let f = fixture(2);
        let cancel = CancellationToken::new();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let mut outbox = f.router.open_outbox(f.session_id.clone(), pid("p1"), cancel.clone(), fail_tx);

        f.transport.delay_for(&pid("p2"), Duration::from_secs(30));
        let env = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("p2"), Bytes::new());
        outbox.submit(env).unwrap();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), outbox.flush())
            .await
            .expect("flush must return promptly after cancel");
        assert_eq!(f.registry.party_count(&f.session_id), 2);
    }

    #[tokio::test]
    async fn metrics_count_deliveries_and_retries() {
        let metrics = Arc::new(MetricsRecorder::new());
        let f = fixture(2);
        let router = MessageRouter::new(
            Arc::clone(&f.registry),
            f.transport.clone() as Arc<dyn Transport>,
            RouterConfig {
                backoff: Duration::from_millis(1),
                ..Default::default()
            },
        )
        .with_metrics(Arc::clone(&metrics));

        f.transport.fail_next(&pid("p2"), TransportError::Connect("refused".into()), 1);
        let env = MessageEnvelope::direct(f.session_id.clone(), pid("p1"), pid("p2"), Bytes::new());
        router.send(&env).await.unwrap();

        assert_eq!(metrics.counter_get("router.deliveries.total", &[]), 1);
        assert_eq!(metrics.counter_get("router.retries.total", &[]), 1);
        assert_eq!(metrics.counter_get("router.failures.total", &[]), 0);
    }
}
