use std::sync::atomic::{AtomicIsize, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::ServiceError;
use crate::memory::MemorySnapshot;

/// Read-only liveness/capacity view surfaced to callers.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub device_allocated_bytes: u64,
    pub device_reserved_bytes: u64,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

/// Shared status cell. The generation worker is the only writer of the
/// snapshot and fault latch; handlers and probes only read. Fatal faults
/// latch permanently: a wedged device or a ceiling violation needs operator
/// intervention, not a green health check.
pub struct ServiceStatus {
    snapshot: RwLock<MemorySnapshot>,
    fault: RwLock<Option<String>>,
    // Signed: a job can be retired by the worker before its submitter's
    // increment lands, so the raw value may dip below zero transiently.
    queue_depth: AtomicIsize,
}

impl ServiceStatus {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(MemorySnapshot::empty()),
            fault: RwLock::new(None),
            queue_depth: AtomicIsize::new(0),
        }
    }

    pub fn publish(&self, snapshot: MemorySnapshot) {
        *self.snapshot.write() = snapshot;
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        *self.snapshot.read()
    }

    pub fn latch_fault(&self, error: &ServiceError) {
        if !error.is_fatal() {
            return;
        }
        let mut fault = self.fault.write();
        if fault.is_none() {
            tracing::error!(%error, "fatal fault latched; service reports unhealthy");
            *fault = Some(error.to_string());
        }
    }

    pub fn probe(&self) -> HealthReport {
        let snapshot = self.snapshot();
        let fault = self.fault.read().clone();
        HealthReport {
            ok: fault.is_none(),
            device_allocated_bytes: snapshot.device_allocated_bytes,
            device_reserved_bytes: snapshot.device_reserved_bytes,
            queue_depth: self.queue_depth(),
            fault,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire).max(0) as usize
    }

    pub(crate) fn job_admitted(&self) {
        self.queue_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn job_retired(&self) {
        self.queue_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::new()
    }
}
