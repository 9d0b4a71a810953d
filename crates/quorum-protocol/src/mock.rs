use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use quorum_core::{
    EngineChannels, EngineFactory, EngineFailure, InboundMessage, OutgoingMessage, Party,
    ProtocolEngine, ProtocolKind, ProtocolOutput, ProtocolParams,
};

/// Scripted behaviour of one mock party.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Broadcast once, complete after hearing from every peer.
    #[default]
    SucceedAfterOneRound,
    /// `start()` itself fails.
    FailOnStart,
    /// The first fed message is rejected.
    FailOnFeed,
    /// Completion reports a protocol failure after the round.
    FailAfterRound,
    /// Broadcast, then never complete.
    Hang,
    /// Complete with an output no other party produces.
    Disagree,
    /// Emit a point-to-point message with no recipient.
    EmitUnaddressed,
}

pub const MOCK_PUBLIC_KEY: &[u8] = b"mock-public-key";

/// Counters shared by every engine a factory creates.
#[derive(Debug, Default)]
pub struct MockStats {
    pub starts: AtomicUsize,
    pub feeds: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockStats {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
    pub fn feeds(&self) -> usize {
        self.feeds.load(Ordering::SeqCst)
    }
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockState {
    kind: Option<ProtocolKind>,
    index: u16,
    expected: usize,
    received: usize,
    outgoing: Option<mpsc::UnboundedSender<OutgoingMessage>>,
    completion: Option<oneshot::Sender<Result<ProtocolOutput, EngineFailure>>>,
}

/// One-round fake engine for orchestration tests.
pub struct MockEngine {
    behavior: MockBehavior,
    state: Mutex<MockState>,
    stats: Arc<MockStats>,
}

impl MockEngine {
    pub fn new(behavior: MockBehavior, stats: Arc<MockStats>) -> Self {
        Self {
            behavior,
            state: Mutex::new(MockState::default()),
            stats,
        }
    }

    fn output(&self, state: &MockState) -> ProtocolOutput {
        let tag = if self.behavior == MockBehavior::Disagree {
            format!("disagree-{}", state.index)
        } else {
            "agreed".to_string()
        };
        match &state.kind {
            Some(ProtocolKind::Sign { message, .. }) => ProtocolOutput::Signature {
                r: Bytes::from(format!("r:{tag}:{}", message.len())),
                s: Bytes::from(format!("s:{tag}")),
            },
            _ if tag == "agreed" => ProtocolOutput::PublicKey(Bytes::from_static(MOCK_PUBLIC_KEY)),
            _ => ProtocolOutput::PublicKey(Bytes::from(tag)),
        }
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn start(&self, params: ProtocolParams) -> Result<EngineChannels, EngineFailure> {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        if self.behavior == MockBehavior::FailOnStart {
            return Err(EngineFailure::new("mock engine refused to start"));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let round_one = format!("round-1 from {}", params.local.index);
        let _ = out_tx.send(OutgoingMessage::broadcast(Bytes::from(round_one)));
        if self.behavior == MockBehavior::EmitUnaddressed {
            let _ = out_tx.send(OutgoingMessage {
                to: Vec::new(),
                is_broadcast: false,
                payload: Bytes::from_static(b"unaddressed"),
            });
        }

        let mut state = self.state.lock();
        state.kind = Some(params.kind);
        state.index = params.local.index;
        state.expected = params.parties.len().saturating_sub(1);
        state.outgoing = Some(out_tx);
        state.completion = Some(done_tx);

        Ok(EngineChannels {
            outgoing: Box::pin(UnboundedReceiverStream::new(out_rx)),
            completion: done_rx,
        })
    }

    async fn feed(&self, _message: InboundMessage) -> Result<(), EngineFailure> {
        self.stats.feeds.fetch_add(1, Ordering::SeqCst);
        if self.behavior == MockBehavior::FailOnFeed {
            return Err(EngineFailure::new("mock engine rejected message"));
        }

        let mut state = self.state.lock();
        state.received += 1;
        if state.received < state.expected || self.behavior == MockBehavior::Hang {
            return Ok(());
        }

        let result = if self.behavior == MockBehavior::FailAfterRound {
            Err(EngineFailure::new("mock protocol failure"))
        } else {
            Ok(self.output(&state))
        };
        if let Some(tx) = state.completion.take() {
            let _ = tx.send(result);
        }
        state.outgoing = None;
        Ok(())
    }

    async fn shutdown(&self) {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.outgoing = None;
        state.completion = None;
    }
}

/// Hands out [`MockEngine`]s, with per-ordinal behaviour overrides.
#[derive(Default)]
pub struct MockEngineFactory {
    default: MockBehavior,
    overrides: HashMap<u16, MockBehavior>,
    stats: Arc<MockStats>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every party behaves like `behavior` unless overridden.
    pub fn all(behavior: MockBehavior) -> Self {
        Self {
            default: behavior,
            ..Self::default()
        }
    }

    /// Party with ordinal `index` behaves like `behavior`.
    pub fn with_party(mut self, index: u16, behavior: MockBehavior) -> Self {
        self.overrides.insert(index, behavior);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, party: &Party) -> Arc<dyn ProtocolEngine> {
        let behavior = self
            .overrides
            .get(&party.index)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        Arc::new(MockEngine::new(behavior, Arc::clone(&self.stats)))
    }
}
