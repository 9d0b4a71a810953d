use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::errors::SessionError;
use crate::ids::{PartyId, SessionId};
use crate::worker::WorkerUnit;

/// One protocol participant within a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub id: PartyId,
    pub label: String,
    /// 1-based ordinal, frozen for the session lifetime.
    pub index: u16,
    pub address: String,
}

/// Participant identity before an ordinal has been assigned.
#[derive(Clone, Debug)]
pub struct PartySeed {
    pub id: PartyId,
    pub label: String,
    pub address: String,
}

impl From<&WorkerUnit> for PartySeed {
    fn from(unit: &WorkerUnit) -> Self {
        Self {
            id: PartyId::from_raw(unit.name.clone()),
            label: unit.name.clone(),
            address: unit.address.clone(),
        }
    }
}

/// Ordered, immutable participant set of one session.
///
/// Ordinals are assigned once by sorting on party id and numbering 1..=N.
/// The set is shared by reference between drivers and cannot be reordered.
#[derive(Clone, Debug)]
pub struct PartySet {
    session_id: SessionId,
    parties: Arc<[Party]>,
}

impl PartySet {
    pub fn new(session_id: SessionId, seeds: Vec<PartySeed>) -> Result<Self, SessionError> {
        if seeds.len() > u16::MAX as usize {
            return Err(SessionError::InvalidParameters(format!(
                "{} parties exceeds the ordinal range",
                seeds.len()
            )));
        }

        let mut seen = HashSet::with_capacity(seeds.len());
        for seed in &seeds {
            if !seen.insert(seed.id.clone()) {
                return Err(SessionError::DuplicateParty {
                    session_id,
                    party_id: seed.id.clone(),
                });
            }
        }

        let mut seeds = seeds;
        seeds.sort_by(|a, b| a.id.cmp(&b.id));
        let parties: Vec<Party> = seeds
            .into_iter()
            .enumerate()
            .map(|(i, seed)| Party {
                id: seed.id,
                label: seed.label,
                index: (i + 1) as u16,
                address: seed.address,
            })
            .collect();

        Ok(Self {
            session_id,
            parties: parties.into(),
        })
    }

    pub fn from_workers(session_id: SessionId, units: &[WorkerUnit]) -> Result<Self, SessionError> {
        Self::new(session_id, units.iter().map(PartySeed::from).collect())
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    /// Parties in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = &Party> {
        self.parties.iter()
    }

    pub fn get(&self, id: &PartyId) -> Option<&Party> {
        self.parties.iter().find(|p| &p.id == id)
    }

    pub fn by_index(&self, index: u16) -> Option<&Party> {
        index
            .checked_sub(1)
            .and_then(|i| self.parties.get(i as usize))
    }

    /// Everyone except `id`, in ordinal order.
    pub fn peers_of<'a>(&'a self, id: &'a PartyId) -> impl Iterator<Item = &'a Party> + 'a {
        self.parties.iter().filter(move |p| &p.id != id)
    }
}
