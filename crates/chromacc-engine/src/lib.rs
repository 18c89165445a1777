//! Chromacc Engine
//!
//! The concurrent batch-execution core: single-batch admission, dynamic
//! worker-pool sizing, per-item timeout envelopes, thread-safe session
//! state, and the drain-then-release shutdown protocol. The correction
//! math itself stays behind `chromacc_core::CorrectionPipeline`.

pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod shutdown;
pub mod workers;

pub use batch::{BatchSnapshot, BatchState, ItemProgress, ItemResult, ItemStatus};
pub use config::EngineConfig;
pub use error::EngineError;
pub use orchestrator::{BatchOrchestrator, BatchRequest, BatchTicket, SingleRunSummary};
pub use registry::{ModelHandle, SessionRegistry};
pub use shutdown::ShutdownCoordinator;
