//! Deterministic two-round stand-in for a threshold ECDSA engine.
//!
//! Round 1: every party broadcasts `sha256(contribution)`.
//! Round 2: once all commitments are in, every party reveals its contribution
//! point-to-point to each peer. Reveals are checked against the commitments and
//! the output is a hash over all contributions in ordinal order, so every
//! honest party ends with the same value. Messages may arrive in any order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use quorum_core::{
    EngineChannels, EngineFactory, EngineFailure, InboundMessage, OutgoingMessage, Party, PartyId,
    ProtocolEngine, ProtocolKind, ProtocolOutput, ProtocolParams,
};

type Hash = [u8; 32];

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
enum RoundMessage {
    Commit { commitment: String },
    Reveal { contribution: String },
}

impl RoundMessage {
    fn encode(&self) -> Result<Bytes, EngineFailure> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EngineFailure::new(format!("failed to encode round message: {e}")))
    }
}

struct Run {
    params: ProtocolParams,
    contribution: Hash,
    commitments: HashMap<PartyId, Hash>,
    /// Reveals whose commitment has not arrived yet.
    pending_reveals: HashMap<PartyId, Hash>,
    verified: BTreeMap<u16, Hash>,
    revealed: bool,
    outgoing: Option<mpsc::UnboundedSender<OutgoingMessage>>,
    completion: Option<oneshot::Sender<Result<ProtocolOutput, EngineFailure>>>,
}

impl Run {
    fn peer_count(&self) -> usize {
        self.params.parties.len() - 1
    }

    fn send(&self, message: OutgoingMessage) {
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(message);
        }
    }

    fn on_commit(&mut self, from: &PartyId, commitment: Hash) -> Result<(), EngineFailure> {
        if self.commitments.insert(from.clone(), commitment).is_some() {
            return Err(blame(from, "duplicate commitment"));
        }
        if let Some(contribution) = self.pending_reveals.remove(from) {
            self.verify(from, contribution)?;
        }
        Ok(())
    }

    fn on_reveal(&mut self, from: &PartyId, contribution: Hash) -> Result<(), EngineFailure> {
        let index = self.index_of(from)?;
        if self.verified.contains_key(&index) || self.pending_reveals.contains_key(from) {
            return Err(blame(from, "duplicate reveal"));
        }
        if self.commitments.contains_key(from) {
            self.verify(from, contribution)
        } else {
            self.pending_reveals.insert(from.clone(), contribution);
            Ok(())
        }
    }

    fn verify(&mut self, from: &PartyId, contribution: Hash) -> Result<(), EngineFailure> {
        let expected = self.commitments.get(from).copied();
        if expected != Some(commit(&contribution)) {
            return Err(blame(from, "reveal does not match commitment"));
        }
        let index = self.index_of(from)?;
        self.verified.insert(index, contribution);
        Ok(())
    }

    fn index_of(&self, id: &PartyId) -> Result<u16, EngineFailure> {
        self.params
            .parties
            .get(id)
            .map(|p| p.index)
            .ok_or_else(|| blame(id, "sender is not a session party"))
    }

    /// Send reveals once every commitment is in, and finish once every reveal checks out.
    fn advance(&mut self) -> Result<(), EngineFailure> {
        if !self.revealed && self.commitments.len() == self.peer_count() {
            let reveal = RoundMessage::Reveal {
                contribution: hex::encode(self.contribution),
            }
            .encode()?;
            for peer in self.params.parties.peers_of(&self.params.local.id) {
                self.send(OutgoingMessage::direct(peer.id.clone(), reveal.clone()));
            }
            self.revealed = true;
        }

        if self.verified.len() == self.params.parties.len() {
            let output = self.output();
            debug!(party_id = %self.params.local.id, "simulated protocol complete");
            if let Some(tx) = self.completion.take() {
                let _ = tx.send(Ok(output));
            }
            self.outgoing = None;
        }
        Ok(())
    }

    fn output(&self) -> ProtocolOutput {
        match &self.params.kind {
            ProtocolKind::Keygen => {
                let digest = transcript(b"quorum/keygen", &self.verified, &[]);
                let mut key = BytesMut::with_capacity(33);
                key.put_u8(0x02);
                key.put_slice(&digest);
                ProtocolOutput::PublicKey(key.freeze())
            }
            ProtocolKind::Sign { key_share, message } => {
                let extra = [message.as_ref(), key_share.as_ref()];
                ProtocolOutput::Signature {
                    r: Bytes::copy_from_slice(&transcript(b"quorum/sign/r", &self.verified, &extra)),
                    s: Bytes::copy_from_slice(&transcript(b"quorum/sign/s", &self.verified, &extra)),
                }
            }
        }
    }
}

fn commit(contribution: &Hash) -> Hash {
    Sha256::digest(contribution).into()
}

fn transcript(label: &[u8], contributions: &BTreeMap<u16, Hash>, extra: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(label);
    for (index, contribution) in contributions {
        hasher.update(index.to_be_bytes());
        hasher.update(contribution);
    }
    for part in extra {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn blame(party: &PartyId, reason: &str) -> EngineFailure {
    EngineFailure::new(format!("{reason} from {party}")).with_culprits(vec![party.clone()])
}

fn decode_hash(from: &PartyId, hex_str: &str) -> Result<Hash, EngineFailure> {
    let raw = hex::decode(hex_str).map_err(|_| blame(from, "malformed hex"))?;
    raw.try_into().map_err(|_| blame(from, "wrong hash length"))
}

/// One party's simulated engine instance.
pub struct SimulatedEngine {
    party_id: PartyId,
    run: Mutex<Option<Run>>,
}

impl SimulatedEngine {
    pub fn new(party_id: PartyId) -> Self {
        Self {
            party_id,
            run: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProtocolEngine for SimulatedEngine {
    async fn start(&self, params: ProtocolParams) -> Result<EngineChannels, EngineFailure> {
        if params.parties.len() < 2 {
            return Err(EngineFailure::new("at least two parties are required"));
        }
        let mut run_slot = self.run.lock();
        if run_slot.is_some() {
            return Err(EngineFailure::new("engine already started"));
        }

        let mut contribution = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut contribution);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let mut verified = BTreeMap::new();
        verified.insert(params.local.index, contribution);

        let run = Run {
            params,
            contribution,
            commitments: HashMap::new(),
            pending_reveals: HashMap::new(),
            verified,
            revealed: false,
            outgoing: Some(out_tx),
            completion: Some(done_tx),
        };

        let commitment = RoundMessage::Commit {
            commitment: hex::encode(commit(&contribution)),
        }
        .encode()?;
        run.send(OutgoingMessage::broadcast(commitment));
        *run_slot = Some(run);

        Ok(EngineChannels {
            outgoing: Box::pin(UnboundedReceiverStream::new(out_rx)),
            completion: done_rx,
        })
    }

    async fn feed(&self, message: InboundMessage) -> Result<(), EngineFailure> {
        let mut run_slot = self.run.lock();
        let run = run_slot
            .as_mut()
            .ok_or_else(|| EngineFailure::new(format!("engine for {} not started", self.party_id)))?;

        run.index_of(&message.from)?;
        let parsed: RoundMessage = serde_json::from_slice(&message.payload)
            .map_err(|_| blame(&message.from, "undecodable round message"))?;

        match parsed {
            RoundMessage::Commit { commitment } => {
                if !message.is_broadcast {
                    return Err(blame(&message.from, "commitment must be broadcast"));
                }
                let commitment = decode_hash(&message.from, &commitment)?;
                run.on_commit(&message.from, commitment)?;
            }
            RoundMessage::Reveal { contribution } => {
                let contribution = decode_hash(&message.from, &contribution)?;
                run.on_reveal(&message.from, contribution)?;
            }
        }
        run.advance()
    }

    async fn shutdown(&self) {
        self.run.lock().take();
    }
}

/// Creates a [`SimulatedEngine`] per party.
#[derive(Default)]
pub struct SimulatedEngineFactory;

impl EngineFactory for SimulatedEngineFactory {
    fn create(&self, party: &Party) -> Arc<dyn ProtocolEngine> {
        Arc::new(SimulatedEngine::new(party.id.clone()))
    }
}
