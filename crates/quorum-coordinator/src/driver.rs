use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use quorum_core::{
    EngineFailure, InboundMessage, MessageEnvelope, OutgoingMessage, OutgoingStream, PartyId,
    ProtocolEngine, ProtocolOutput, ProtocolParams, SessionError,
};

use crate::registry::Inbox;
use crate::router::{MessageRouter, Outbox};

/// Lifecycle of one party's protocol run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Created,
    Started,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// How long a completed party keeps delivering messages it already produced.
    pub flush_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(2),
        }
    }
}

/// Terminal outcome of one driver, observed by the session's join barrier.
#[derive(Debug)]
pub struct DriverReport {
    pub party_id: PartyId,
    pub index: u16,
    pub state: DriverState,
    pub result: Result<ProtocolOutput, SessionError>,
}

/// Supervises one party: starts its engine, pumps outgoing messages to the
/// router and inbound messages into the engine, and waits for completion.
pub struct RoundDriver {
    params: ProtocolParams,
    engine: Arc<dyn ProtocolEngine>,
    router: Arc<MessageRouter>,
    inbox: Inbox,
    config: DriverConfig,
    state: watch::Sender<DriverState>,
}

impl RoundDriver {
    pub fn new(
        params: ProtocolParams,
        engine: Arc<dyn ProtocolEngine>,
        router: Arc<MessageRouter>,
        inbox: Inbox,
        config: DriverConfig,
    ) -> Self {
        let (state, _) = watch::channel(DriverState::Created);
        Self {
            params,
            engine,
            router,
            inbox,
            config,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    /// Run to a terminal state. The engine is shut down on every path.
    #[instrument(
        skip_all,
        fields(session_id = %self.params.session_id, party_id = %self.params.local.id, index = self.params.local.index)
    )]
    pub async fn run(self, cancel: CancellationToken) -> DriverReport {
        let RoundDriver {
            params,
            engine,
            router,
            inbox,
            config,
            state,
        } = self;

        let result = drive(&params, &engine, &router, inbox, &config, &state, &cancel).await;
        engine.shutdown().await;

        let terminal = match &result {
            Ok(_) => {
                info!("party completed");
                DriverState::Completed
            }
            Err(SessionError::Cancelled) => {
                debug!("party cancelled");
                DriverState::Cancelled
            }
            Err(err) => {
                warn!(error = %err, kind = err.error_kind(), "party failed");
                DriverState::Failed
            }
        };
        state.send_replace(terminal);

        DriverReport {
            party_id: params.local.id.clone(),
            index: params.local.index,
            state: terminal,
            result,
        }
    }
}

fn engine_error(party_id: &PartyId, failure: EngineFailure) -> SessionError {
    SessionError::Engine {
        party_id: party_id.clone(),
        failure,
    }
}

async fn drive(
    params: &ProtocolParams,
    engine: &Arc<dyn ProtocolEngine>,
    router: &Arc<MessageRouter>,
    inbox: Inbox,
    config: &DriverConfig,
    state: &watch::Sender<DriverState>,
    cancel: &CancellationToken,
) -> Result<ProtocolOutput, SessionError> {
    let party_id = &params.local.id;
    if cancel.is_cancelled() {
        return Err(SessionError::Cancelled);
    }

    state.send_replace(DriverState::Started);
    let channels = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        started = engine.start(params.clone()) => started.map_err(|f| engine_error(party_id, f))?,
    };
    state.send_replace(DriverState::Running);

    // Both pumps stop on this token; it also fires when the session is cancelled.
    let pumps = cancel.child_token();
    let drain = CancellationToken::new();
    let (failures_tx, mut failures) = mpsc::unbounded_channel();

    let outbox = router.open_outbox(
        params.session_id.clone(),
        party_id.clone(),
        pumps.clone(),
        failures_tx.clone(),
    );
    let mut outgoing = tokio::spawn(pump_outgoing(
        channels.outgoing,
        outbox,
        pumps.clone(),
        drain.clone(),
    ));
    let mut outgoing_done = false;
    let incoming = tokio::spawn(pump_incoming(
        inbox,
        Arc::clone(engine),
        party_id.clone(),
        pumps.clone(),
        failures_tx,
    ));

    let mut completion = channels.completion;
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        Some(err) = failures.recv() => Err(err),
        done = &mut completion => match done {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(failure)) => Err(engine_error(party_id, failure)),
            Err(_) => Err(engine_error(
                party_id,
                EngineFailure::new("engine dropped its completion channel"),
            )),
        },
    };

    let outcome = match outcome {
        Ok(output) => {
            // Peers may still be waiting on this party's last round.
            drain.cancel();
            outgoing_done = tokio::time::timeout(config.flush_timeout, &mut outgoing)
                .await
                .is_ok();
            if !outgoing_done {
                warn!(
                    flush_timeout_ms = config.flush_timeout.as_millis() as u64,
                    "outgoing flush timed out"
                );
            }
            match failures.try_recv() {
                Ok(err) => Err(err),
                Err(_) => Ok(output),
            }
        }
        Err(err) => Err(err),
    };

    pumps.cancel();
    if !outgoing_done {
        let _ = outgoing.await;
    }
    let _ = incoming.await;
    outcome
}

/// Engine → router. Returns when the stream ends and lanes are flushed, on
/// the first routing error, or on cancellation.
async fn pump_outgoing(
    mut outgoing: OutgoingStream,
    mut outbox: Outbox,
    cancel: CancellationToken,
    drain: CancellationToken,
) {
    let mut ended = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = drain.cancelled() => break,
            next = outgoing.next() => match next {
                Some(message) => {
                    if !submit(&mut outbox, message) {
                        return;
                    }
                }
                None => {
                    ended = true;
                    break;
                }
            },
        }
    }

    if !ended {
        while let Some(Some(message)) = outgoing.next().now_or_never() {
            if !submit(&mut outbox, message) {
                return;
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = outbox.flush() => {}
    }
}

fn submit(outbox: &mut Outbox, message: OutgoingMessage) -> bool {
    let envelope = MessageEnvelope::from_parts(
        outbox.session_id().clone(),
        outbox.sender().clone(),
        message.to,
        message.is_broadcast,
        message.payload,
    );
    match outbox.submit(envelope) {
        Ok(_) => true,
        Err(err) => {
            outbox.report_failure(err);
            false
        }
    }
}

/// Inbox → engine, in arrival order.
async fn pump_incoming(
    mut inbox: Inbox,
    engine: Arc<dyn ProtocolEngine>,
    party_id: PartyId,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<SessionError>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = inbox.recv() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };

        let message = InboundMessage {
            from: envelope.from().clone(),
            is_broadcast: envelope.is_broadcast(),
            payload: envelope.payload().clone(),
        };
        let fed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            fed = engine.feed(message) => fed,
        };
        if let Err(failure) = fed {
            let _ = failures.send(engine_error(&party_id, failure));
            return;
        }
    }
}
