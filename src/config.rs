use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::memory::ResidencyPolicy;
use crate::model::MemoryProfile;

const GIB: u64 = 1024 * 1024 * 1024;

/// Service configuration, loaded from the environment once at process start
/// and never re-read.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub residency_policy: ResidencyPolicy,
    pub device_memory_ceiling_bytes: u64,
    pub queue_depth_limit: usize,
    pub default_timeout: Duration,
    pub reclaim_interval: Duration,
    pub model_profile: MemoryProfile,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7860".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7860));

        let model_id = env::var("MODEL_ID").unwrap_or_else(|_| "stabilityai/sdxl-turbo".into());

        let residency_policy = match env::var("RESIDENCY_POLICY") {
            Ok(raw) => raw
                .parse::<ResidencyPolicy>()
                .map_err(|msg| anyhow::anyhow!(msg))?,
            Err(_) => ResidencyPolicy::Offload,
        };

        let device_memory_ceiling_bytes = env::var("DEVICE_MEMORY_CEILING_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8 * GIB);
        let queue_depth_limit = env::var("QUEUE_DEPTH_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);
        let default_timeout = env::var("DEFAULT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));
        let reclaim_interval = env::var("RECLAIM_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(300));

        let defaults = MemoryProfile::default();
        let device_full_bytes = env::var("MODEL_DEVICE_FULL_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.device_full_bytes);
        let device_working_set_bytes = env::var("MODEL_WORKING_SET_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.device_working_set_bytes);
        let model_profile = MemoryProfile {
            host_bytes: device_full_bytes,
            device_full_bytes,
            device_working_set_bytes,
        };

        // A resident baseline above the ceiling could never pass the
        // post-job check; refuse to start rather than fail on job one.
        if residency_policy == ResidencyPolicy::Resident
            && model_profile.device_full_bytes > device_memory_ceiling_bytes
        {
            anyhow::bail!(
                "resident policy needs a ceiling of at least {} bytes (model full footprint), got {}",
                model_profile.device_full_bytes,
                device_memory_ceiling_bytes
            );
        }

        Ok(Self {
            listen_addr,
            model_id,
            residency_policy,
            device_memory_ceiling_bytes,
            queue_depth_limit,
            default_timeout,
            reclaim_interval,
            model_profile,
        })
    }
}
