pub mod driver;
pub mod orchestrator;
pub mod pool;
pub mod provision;
pub mod registry;
pub mod router;

pub use driver::{DriverConfig, DriverReport, DriverState, RoundDriver};
pub use orchestrator::{
    KeygenResult, OrchestratorConfig, SessionInfo, SessionOrchestrator, SignRequest, SignResult,
};
pub use pool::{PoolConfig, WorkerLease, WorkerPool};
pub use provision::{MockProvisioner, StaticProvisioner};
pub use registry::{Inbox, PartyRegistry};
pub use router::{MessageRouter, Outbox, RouterConfig};
