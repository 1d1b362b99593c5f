pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod memory;
pub mod model;
pub mod queue;
pub mod request;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use health::ServiceStatus;
pub use memory::{MemorySnapshot, Residency, ResidencyController, ResidencyPolicy};
pub use queue::{JobQueue, JobTicket};
pub use request::{GenerationRequest, QualityTier, RawGenerationRequest};
pub use server::build_router;
