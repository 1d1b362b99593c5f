const GIB: u64 = 1024 * 1024 * 1024;

/// Per-job parameters handed to the pipeline. Everything the output depends
/// on is in here; two renders with equal params must produce equal images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: u64,
}

/// Memory footprint profile of the (opaque) model: how many bytes its
/// weights occupy on each tier. The working set is the slice of the model
/// that must be device-resident at any instant under the offload policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProfile {
    pub host_bytes: u64,
    pub device_full_bytes: u64,
    pub device_working_set_bytes: u64,
}

impl Default for MemoryProfile {
    /// SDXL-class fp16 checkpoint: ~7 GiB fully resident, ~1.5 GiB for the
    /// largest single submodule.
    fn default() -> Self {
        Self {
            host_bytes: 7 * GIB,
            device_full_bytes: 7 * GIB,
            device_working_set_bytes: 3 * GIB / 2,
        }
    }
}
