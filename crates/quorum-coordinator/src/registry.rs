use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use quorum_core::{InboundSink, MessageEnvelope, Party, PartyId, SessionError, SessionId};

/// Receiving end of a party's inbound queue. FIFO in arrival order.
pub type Inbox = mpsc::UnboundedReceiver<MessageEnvelope>;

struct PartyEntry {
    party: Party,
    inbox: mpsc::UnboundedSender<MessageEnvelope>,
}

/// Per-session participant state: identity, endpoint and inbound queue.
///
/// Sessions never share entries, so each one is a single map entry guarded by
/// its shard lock. No method holds a shard lock while calling out.
pub struct PartyRegistry {
    sessions: DashMap<SessionId, HashMap<PartyId, PartyEntry>>,
}

impl Default for PartyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PartyRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Add a party and open its inbound queue.
    pub fn register(&self, session_id: &SessionId, party: Party) -> Result<Inbox, SessionError> {
        let mut parties = self.sessions.entry(session_id.clone()).or_default();
        if parties.contains_key(&party.id) {
            return Err(SessionError::DuplicateParty {
                session_id: session_id.clone(),
                party_id: party.id,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(session_id = %session_id, party_id = %party.id, index = party.index, "party registered");
        parties.insert(party.id.clone(), PartyEntry { party, inbox: tx });
        Ok(rx)
    }

    pub fn lookup(&self, session_id: &SessionId, party_id: &PartyId) -> Result<Party, SessionError> {
        let parties = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        parties
            .get(party_id)
            .map(|e| e.party.clone())
            .ok_or_else(|| SessionError::UnknownParty {
                session_id: session_id.clone(),
                party_id: party_id.clone(),
            })
    }

    /// Every registered party of the session except `exclude`, in ordinal order.
    pub fn peers(&self, session_id: &SessionId, exclude: &PartyId) -> Result<Vec<Party>, SessionError> {
        let parties = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        let mut peers: Vec<Party> = parties
            .values()
            .filter(|e| &e.party.id != exclude)
            .map(|e| e.party.clone())
            .collect();
        peers.sort_by_key(|p| p.index);
        Ok(peers)
    }

    pub fn party_count(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |p| p.len())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every party of a finished session, closing their queues.
    /// Returns how many parties were removed.
    pub fn unregister_session(&self, session_id: &SessionId) -> usize {
        match self.sessions.remove(session_id) {
            Some((_, parties)) => {
                info!(session_id = %session_id, parties = parties.len(), "session unregistered");
                parties.len()
            }
            None => 0,
        }
    }
}

impl InboundSink for PartyRegistry {
    fn deposit(&self, recipient: &PartyId, envelope: MessageEnvelope) -> Result<(), SessionError> {
        let session_id = envelope.session_id().clone();
        let parties = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;

        if !parties.contains_key(envelope.from()) {
            return Err(SessionError::UnknownParty {
                session_id,
                party_id: envelope.from().clone(),
            });
        }
        let entry = parties.get(recipient).ok_or_else(|| SessionError::UnknownParty {
            session_id: session_id.clone(),
            party_id: recipient.clone(),
        })?;

        if entry.inbox.send(envelope).is_err() {
            // The party already reached a terminal state; late traffic is expected.
            debug!(session_id = %session_id, party_id = %recipient, "dropping message for finished party");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quorum_core::{PartySeed, PartySet};

    fn parties(session_id: &SessionId, names: &[&str]) -> PartySet {
        let seeds = names
            .iter()
            .map(|n| PartySeed {
                id: PartyId::from_raw(*n),
                label: n.to_string(),
                address: format!("{n}:9000"),
            })
            .collect();
        PartySet::new(session_id.clone(), seeds).unwrap()
    }

    fn register_all(registry: &PartyRegistry, set: &PartySet) -> Vec<Inbox> {
        set.iter()
            .map(|p| registry.register(set.session_id(), p.clone()).unwrap())
            .collect()
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = PartyRegistry::new();
        let sid = SessionId::new();
        let set = parties(&sid, &["a", "b"]);
        let _inboxes = register_all(&registry, &set);

        let err = registry.register(&sid, set.by_index(1).unwrap().clone()).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateParty { .. }), "got: {err}");
    }

    #[test]
    fn same_party_id_in_two_sessions_is_fine() {
        let registry = PartyRegistry::new();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        let _a = register_all(&registry, &parties(&s1, &["a", "b"]));
        let _b = register_all(&registry, &parties(&s2, &["a", "b"]));
        assert_eq!(registry.session_count(), 2);
    }

    #[test]
    fn lookup_distinguishes_session_and_party() {
        let registry = PartyRegistry::new();
        let sid = SessionId::new();
        let _inboxes = register_all(&registry, &parties(&sid, &["a", "b"]));

        assert_eq!(registry.lookup(&sid, &PartyId::from_raw("b")).unwrap().index, 2);
        assert!(matches!(
            registry.lookup(&sid, &PartyId::from_raw("z")),
            Err(SessionError::UnknownParty { .. })
        ));
        assert!(matches!(
            registry.lookup(&SessionId::new(), &PartyId::from_raw("a")),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[test]
    fn peers_sorted_by_index_without_self() {
        let registry = PartyRegistry::new();
        let sid = SessionId::new();
        let _inboxes = register_all(&registry, &parties(&sid, &["d", "b", "a", "c"]));

        let peers = registry.peers(&sid, &PartyId::from_raw("b")).unwrap();
        let ids: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "d"]);
    }

    #[tokio::test]
    async fn deposit_preserves_arrival_order() {
        let registry = PartyRegistry::new();
        let sid = SessionId::new();
        let mut inboxes = register_all(&registry, &parties(&sid, &["a", "b"]));
        let b = PartyId::from_raw("b");

        for i in 0..5u8 {
            let env = MessageEnvelope::direct(sid.clone(), PartyId::from_raw("a"), b.clone(), Bytes::from(vec![i]));
            registry.deposit(&b, env).unwrap();
        }
        for i in 0..5u8 {
            let env = inboxes[1].recv().await.unwrap();
            assert_eq!(env.payload().as_ref(), &[i]);
        }
    }

    #[test]
    fn deposit_from_unregistered_sender_fails() {
        let registry = PartyRegistry::new();
        let sid = SessionId::new();
        let _inboxes = register_all(&registry, &parties(&sid, &["a", "b"]));

        let env = MessageEnvelope::broadcast(sid.clone(), PartyId::from_raw("mallory"), Bytes::new());
        let err = registry.deposit(&PartyId::from_raw("a"), env).unwrap_err();
        assert!(matches!(err, SessionError::UnknownParty { party_id, .. } if party_id.as_str() == "mallory"));
    }

    #[test]
    fn deposit_to_finished_party_is_dropped_quietly() {
        let registry = PartyRegistry::new();
        let sid = SessionId::new();
        let inboxes = register_all(&registry, &parties(&sid, &["a", "b"]));
        drop(inboxes);

        let env = MessageEnvelope::broadcast(sid, PartyId::from_raw("a"), Bytes::new());
        assert!(registry.deposit(&PartyId::from_raw("b"), env).is_ok());
    }

    #[tokio::test]
    async fn unregister_closes_queues() {
        let registry = PartyRegistry::new();
        let sid = SessionId::new();
        let mut inboxes = register_all(&registry, &parties(&sid, &["a", "b", "c"]));

        assert_eq!(registry.unregister_session(&sid), 3);
        assert_eq!(registry.unregister_session(&sid), 0);
        assert_eq!(registry.party_count(&sid), 0);
        assert!(inboxes[0].recv().await.is_none());

        let env = MessageEnvelope::broadcast(sid, PartyId::from_raw("a"), Bytes::new());
        assert!(matches!(
            registry.deposit(&PartyId::from_raw("b"), env),
            Err(SessionError::UnknownSession(_))
        ));
    }
}
