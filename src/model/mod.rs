mod pipeline;
mod types;

pub use pipeline::{DiffusionPipeline, ProceduralPipeline};
pub use types::{MemoryProfile, RenderParams};
