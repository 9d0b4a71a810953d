use serde::{Deserialize, Serialize};

/// One allocable compute unit: a running party process reachable at `address`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerUnit {
    /// Unique within the pool.
    pub name: String,
    /// `host:port` the transport dials to reach this worker.
    pub address: String,
}

impl WorkerUnit {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    InUse,
}
