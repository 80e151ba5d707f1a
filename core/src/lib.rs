pub mod config;
pub mod engine;
pub mod envelope;
pub mod errors;
pub mod ledger;
pub mod processor;
pub mod request;
pub mod retry;
pub mod sink;
pub mod source;
pub mod supervisor;
pub mod telemetry;
pub mod transform;

pub use config::{ReplicatorConfig, load_config};
pub use engine::{ConsumptionEngine, EngineExit, EngineSettings};
pub use errors::{ReplicatorError, Result};
pub use processor::MessageProcessor;
pub use supervisor::Supervisor;
