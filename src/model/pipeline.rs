use image::{Rgb, RgbImage};

use crate::error::ServiceError;
use crate::model::types::{MemoryProfile, RenderParams};

/// Allocator block granularity mirrored in the reserved-bytes figure, so the
/// snapshot distinguishes "allocated" from "reserved" the way device
/// allocators report them.
const RESERVE_BLOCK_BYTES: u64 = 256 * 1024 * 1024;

/// The seam between the service and the model runtime. The service treats
/// the model as an opaque unit of work with a known footprint profile; a
/// pipeline only moves weights between tiers and renders one image at a
/// time. Implementations are driven by a single owner and never called
/// concurrently.
pub trait DiffusionPipeline: Send {
    fn profile(&self) -> MemoryProfile;

    /// Stage the model weights in host memory (from cold storage).
    fn fetch_to_host(&mut self) -> Result<(), ServiceError>;

    /// Move the full weight set onto the device.
    fn upload_full(&mut self) -> Result<(), ServiceError>;

    /// Move only the active working set onto the device, leaving the rest
    /// host-resident. Peak device use stays bounded at the cost of per-job
    /// transfer latency.
    fn upload_working_set(&mut self) -> Result<(), ServiceError>;

    /// Move all device-resident weights back to host memory.
    fn offload_to_host(&mut self) -> Result<(), ServiceError>;

    /// Drop the weights from both tiers. Neither configured policy has an
    /// `Unloaded` baseline, so today this backs only teardown and an
    /// always-unload baseline would be its first steady-state caller.
    fn unload(&mut self) -> Result<(), ServiceError>;

    /// Render one image. Deterministic for a fixed [`RenderParams`].
    fn render(&mut self, params: &RenderParams) -> Result<RgbImage, ServiceError>;

    fn device_allocated_bytes(&self) -> u64;
    fn device_reserved_bytes(&self) -> u64;
    fn host_model_present(&self) -> bool;
}

/// In-process pipeline used for CPU-only deployments and tests. Renders
/// seeded multi-octave value noise instead of running a diffusion model, and
/// bookkeeps tier movements against its footprint profile so the residency
/// and reclamation machinery sees realistic numbers.
pub struct ProceduralPipeline {
    profile: MemoryProfile,
    host_present: bool,
    device_allocated: u64,
    wedged: bool,
}

impl ProceduralPipeline {
    pub fn new(profile: MemoryProfile) -> Self {
        Self {
            profile,
            host_present: false,
            device_allocated: 0,
            wedged: false,
        }
    }

    /// A pipeline whose device memory never comes back down, simulating the
    /// wedged-allocator fault the reclaim path must detect.
    #[cfg(test)]
    pub(crate) fn new_wedged(profile: MemoryProfile) -> Self {
        Self {
            wedged: true,
            ..Self::new(profile)
        }
    }
}

impl DiffusionPipeline for ProceduralPipeline {
    fn profile(&self) -> MemoryProfile {
        self.profile
    }

    fn fetch_to_host(&mut self) -> Result<(), ServiceError> {
        self.host_present = true;
        Ok(())
    }

    fn upload_full(&mut self) -> Result<(), ServiceError> {
        if !self.host_present {
            return Err(ServiceError::GenerationFailed(
                "weights are not staged in host memory".into(),
            ));
        }
        self.device_allocated = self.profile.device_full_bytes;
        Ok(())
    }

    fn upload_working_set(&mut self) -> Result<(), ServiceError> {
        if !self.host_present {
            return Err(ServiceError::GenerationFailed(
                "weights are not staged in host memory".into(),
            ));
        }
        self.device_allocated = self.profile.device_working_set_bytes;
        Ok(())
    }

    fn offload_to_host(&mut self) -> Result<(), ServiceError> {
        if !self.wedged {
            self.device_allocated = 0;
        }
        self.host_present = true;
        Ok(())
    }

    fn unload(&mut self) -> Result<(), ServiceError> {
        if !self.wedged {
            self.device_allocated = 0;
        }
        self.host_present = false;
        Ok(())
    }

    fn render(&mut self, params: &RenderParams) -> Result<RgbImage, ServiceError> {
        if self.device_allocated == 0 {
            return Err(ServiceError::GenerationFailed(
                "no model weights on the device".into(),
            ));
        }
        Ok(synthesize(params))
    }

    fn device_allocated_bytes(&self) -> u64 {
        self.device_allocated
    }

    fn device_reserved_bytes(&self) -> u64 {
        self.device_allocated.div_ceil(RESERVE_BLOCK_BYTES) * RESERVE_BLOCK_BYTES
    }

    fn host_model_present(&self) -> bool {
        self.host_present
    }
}

/// Deterministic image synthesis: every byte of the output is a pure
/// function of the render parameters. More steps add noise octaves, which
/// stands in for the fidelity/latency trade the step count buys on a real
/// model.
fn synthesize(params: &RenderParams) -> RgbImage {
    let key = derive_key(params);
    let octaves = (params.steps / 4 + 3).min(8);

    RgbImage::from_fn(params.width, params.height, |x, y| {
        let u = x as f32 / params.width as f32;
        let v = y as f32 / params.height as f32;
        let mut channels = [0u8; 3];
        for (c, channel) in channels.iter_mut().enumerate() {
            *channel = (fractal_noise(key, u, v, octaves, c as u64) * 255.0) as u8;
        }
        Rgb(channels)
    })
}

fn derive_key(params: &RenderParams) -> u64 {
    let mut key = splitmix64(params.seed ^ 0x5d3f_92ab_71c6_04e9);
    for byte in params.prompt.bytes() {
        key = splitmix64(key ^ u64::from(byte));
    }
    key = splitmix64(key ^ 0xa0761d6478bd642f);
    for byte in params.negative_prompt.bytes() {
        key = splitmix64(key ^ u64::from(byte));
    }
    key
}

fn fractal_noise(key: u64, u: f32, v: f32, octaves: u32, channel: u64) -> f32 {
    let mut total = 0.0f32;
    let mut amplitude = 1.0f32;
    let mut frequency = 4.0f32;
    let mut norm = 0.0f32;
    for octave in 0..octaves {
        total += amplitude * value_noise(key, u * frequency, v * frequency, octave as u64, channel);
        norm += amplitude;
        amplitude *= 0.5;
        frequency *= 2.0;
    }
    total / norm
}

fn value_noise(key: u64, x: f32, y: f32, octave: u64, channel: u64) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = smoothstep(x - x0);
    let fy = smoothstep(y - y0);
    let (ix, iy) = (x0 as i64, y0 as i64);

    let v00 = lattice(key, ix, iy, octave, channel);
    let v10 = lattice(key, ix + 1, iy, octave, channel);
    let v01 = lattice(key, ix, iy + 1, octave, channel);
    let v11 = lattice(key, ix + 1, iy + 1, octave, channel);

    let top = v00 + (v10 - v00) * fx;
    let bottom = v01 + (v11 - v01) * fx;
    top + (bottom - top) * fy
}

fn lattice(key: u64, ix: i64, iy: i64, octave: u64, channel: u64) -> f32 {
    let mixed = key
        ^ (ix as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ (iy as u64).wrapping_mul(0xc2b2_ae3d_27d4_eb4f)
        ^ (octave * 3 + channel).wrapping_mul(0x1656_67b1_9e37_79f9);
    (splitmix64(mixed) >> 40) as f32 / (1u64 << 24) as f32
}

fn smoothstep(t: f32) -> f32 {
    t * t * (3.0 - 2.0 * t)
}

fn splitmix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
