pub mod simulated;

pub mod mock;

pub use mock::{MockBehavior, MockEngine, MockEngineFactory};
pub use simulated::{SimulatedEngine, SimulatedEngineFactory};
