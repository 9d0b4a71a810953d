use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use quorum_core::{InboundSink, MessageEnvelope, PartyId, Transport, TransportError};

use crate::local::rejection;

/// One call observed by [`MockTransport`].
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub address: String,
    pub recipient: PartyId,
    pub envelope: MessageEnvelope,
}

/// Scriptable transport for tests: records every call, injects failures per
/// recipient, and optionally forwards successful calls to a real sink.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<RecordedCall>>,
    scripted: Mutex<HashMap<PartyId, VecDeque<TransportError>>>,
    unreachable: Mutex<HashSet<PartyId>>,
    delays: Mutex<HashMap<PartyId, Duration>>,
    forward: Option<Arc<dyn InboundSink>>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver successful calls into `sink`, like [`LocalTransport`](crate::LocalTransport).
    pub fn forwarding(sink: Arc<dyn InboundSink>) -> Self {
        Self {
            forward: Some(sink),
            ..Self::default()
        }
    }

    /// The next `times` calls to `recipient` fail with `error`.
    pub fn fail_next(&self, recipient: &PartyId, error: TransportError, times: usize) {
        let mut scripted = self.scripted.lock();
        let queue = scripted.entry(recipient.clone()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Every call to `recipient` fails with a connection error.
    pub fn make_unreachable(&self, recipient: &PartyId) {
        self.unreachable.lock().insert(recipient.clone());
    }

    /// Calls to `recipient` take `delay` before completing.
    pub fn delay_for(&self, recipient: &PartyId, delay: Duration) {
        self.delays.lock().insert(recipient.clone(), delay);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, recipient: &PartyId) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| &c.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call_party(
        &self,
        address: &str,
        recipient: &PartyId,
        envelope: &MessageEnvelope,
    ) -> Result<(), TransportError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(RecordedCall {
            address: address.to_string(),
            recipient: recipient.clone(),
            envelope: envelope.clone(),
        });

        let delay = self.delays.lock().get(recipient).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unreachable.lock().contains(recipient) {
            return Err(TransportError::Connect(format!("{address} unreachable")));
        }
        let scripted = self
            .scripted
            .lock()
            .get_mut(recipient)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        match &self.forward {
            Some(sink) => sink.deposit(recipient, envelope.clone()).map_err(rejection),
            None => Ok(()),
        }
    }
}
