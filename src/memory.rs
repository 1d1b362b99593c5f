use std::str::FromStr;

use serde::Serialize;

use crate::error::ServiceError;
use crate::model::{DiffusionPipeline, RenderParams};

/// Where the model weights live between jobs.
///
/// `Offload` bounds peak device memory by keeping only the working set on
/// the device while a job runs and parking everything on the host
/// afterwards. `Resident` keeps the full model on the device across jobs,
/// minimizing latency at the cost of peak device use. Chosen once at
/// startup, never mutated mid-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyPolicy {
    Offload,
    Resident,
}

impl FromStr for ResidencyPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "offload" => Ok(ResidencyPolicy::Offload),
            "resident" => Ok(ResidencyPolicy::Resident),
            other => Err(format!("unknown residency policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLoad {
    /// Only the active working set is device-resident.
    Partial,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Unloaded,
    HostResident,
    DeviceResident(DeviceLoad),
}

/// Point-in-time view of device memory, recomputed on demand and published
/// after every job. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub device_allocated_bytes: u64,
    pub device_reserved_bytes: u64,
    pub host_model_present: bool,
}

impl MemorySnapshot {
    pub fn empty() -> Self {
        Self {
            device_allocated_bytes: 0,
            device_reserved_bytes: 0,
            host_model_present: false,
        }
    }
}

/// Sole owner and mutator of the residency state and the pipeline behind it.
/// Lives on the single generation worker; serialization of device access is
/// structural, not lock-based.
pub struct ResidencyController {
    policy: ResidencyPolicy,
    ceiling_bytes: u64,
    residency: Residency,
    pipeline: Box<dyn DiffusionPipeline>,
}

impl ResidencyController {
    pub fn new(
        policy: ResidencyPolicy,
        ceiling_bytes: u64,
        pipeline: Box<dyn DiffusionPipeline>,
    ) -> Self {
        Self {
            policy,
            ceiling_bytes,
            residency: Residency::Unloaded,
            pipeline,
        }
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            device_allocated_bytes: self.pipeline.device_allocated_bytes(),
            device_reserved_bytes: self.pipeline.device_reserved_bytes(),
            host_model_present: self.pipeline.host_model_present(),
        }
    }

    /// Device bytes expected after `release_to_baseline`, per policy.
    pub fn baseline_device_bytes(&self) -> u64 {
        match self.policy {
            ResidencyPolicy::Offload => 0,
            ResidencyPolicy::Resident => self.pipeline.profile().device_full_bytes,
        }
    }

    /// Make the model runnable on the device. Under `Offload` the steady
    /// state after this call is `DeviceResident(Partial)`; the call still
    /// succeeded, the remainder of the model is staged on the host.
    pub fn ensure_device_resident(&mut self) -> Result<(), ServiceError> {
        if self.residency == Residency::Unloaded {
            self.pipeline.fetch_to_host()?;
            self.residency = Residency::HostResident;
        }

        let target = match self.policy {
            ResidencyPolicy::Offload => DeviceLoad::Partial,
            ResidencyPolicy::Resident => DeviceLoad::Full,
        };
        if self.residency == Residency::DeviceResident(target) {
            return Ok(());
        }

        match target {
            DeviceLoad::Partial => self.pipeline.upload_working_set()?,
            DeviceLoad::Full => self.pipeline.upload_full()?,
        }
        self.residency = Residency::DeviceResident(target);
        tracing::debug!(residency = ?self.residency, "model placed on device");
        Ok(())
    }

    /// Return to the policy baseline: `HostResident` under `Offload`,
    /// `DeviceResident(Full)` under `Resident`. Idempotent from any state.
    /// A post-transition snapshot above the configured ceiling is a fatal
    /// configuration/environment error, surfaced rather than ignored.
    pub fn release_to_baseline(&mut self) -> Result<MemorySnapshot, ServiceError> {
        match self.policy {
            ResidencyPolicy::Offload => {
                match self.residency {
                    Residency::Unloaded => self.pipeline.fetch_to_host()?,
                    Residency::DeviceResident(_) => self.pipeline.offload_to_host()?,
                    Residency::HostResident => {}
                }
                self.residency = Residency::HostResident;
            }
            ResidencyPolicy::Resident => {
                if self.residency != Residency::DeviceResident(DeviceLoad::Full) {
                    self.ensure_device_resident()?;
                }
            }
        }

        let snapshot = self.snapshot();
        if snapshot.device_allocated_bytes > self.ceiling_bytes {
            return Err(ServiceError::CeilingExceeded {
                allocated_bytes: snapshot.device_allocated_bytes,
                ceiling_bytes: self.ceiling_bytes,
            });
        }
        Ok(snapshot)
    }

    /// Operator-facing reclaim: release to baseline and verify device memory
    /// actually came back down. A device that will not release memory is
    /// wedged; that is reported once, not retried.
    pub fn reclaim_checked(&mut self) -> Result<MemorySnapshot, ServiceError> {
        let snapshot = self.release_to_baseline()?;
        if snapshot.device_allocated_bytes > self.baseline_device_bytes() {
            return Err(ServiceError::MemoryWedged {
                allocated_bytes: snapshot.device_allocated_bytes,
            });
        }
        Ok(snapshot)
    }

    /// Render against the current placement. Does not transition residency;
    /// callers resolve placement through `ensure_device_resident` first.
    pub fn render(&mut self, params: &RenderParams) -> Result<image::RgbImage, ServiceError> {
        if self.residency == Residency::Unloaded {
            return Err(ServiceError::PlacementRequired);
        }
        self.pipeline.render(params)
    }
}
