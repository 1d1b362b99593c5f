use rand::Rng;
use serde::Deserialize;

use crate::error::ServiceError;

pub const MIN_DIMENSION: u32 = 512;
pub const MAX_DIMENSION: u32 = 1024;

/// Seed value that asks the service to pick a random seed, as the original
/// diffusion servers conventionally do.
pub const RANDOM_SEED: i64 = -1;

const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, bad quality, watermark";
const DEFAULT_DIMENSION: u32 = 1024;

/// Wire-level generation request. Absent fields take documented defaults;
/// validation happens in [`validate`] before the request is admitted.
#[derive(Debug, Deserialize)]
pub struct RawGenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub quality_tier: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Fast,
    Balanced,
    Quality,
}

impl QualityTier {
    /// Fixed tier-to-steps table. Turbo-class models saturate quickly, so
    /// even the top tier stays in the low teens.
    pub fn steps(self) -> u32 {
        match self {
            QualityTier::Fast => 4,
            QualityTier::Balanced => 8,
            QualityTier::Quality => 12,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "fast" => Some(QualityTier::Fast),
            "balanced" => Some(QualityTier::Balanced),
            "quality" => Some(QualityTier::Quality),
            _ => None,
        }
    }
}

/// A validated request, consumed exactly once by the generation worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub tier: QualityTier,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

/// Normalizes and bounds-checks a raw request. Out-of-range dimensions are
/// rejected rather than clamped, and the `-1` seed sentinel is replaced with
/// a uniformly-random seed so the response can echo a concrete value back.
pub fn validate(raw: RawGenerationRequest) -> Result<GenerationRequest, ServiceError> {
    let prompt = raw.prompt.trim();
    if prompt.is_empty() {
        return Err(ServiceError::EmptyPrompt);
    }

    let tier = match raw.quality_tier.as_deref() {
        None => QualityTier::Fast,
        Some(name) => {
            QualityTier::parse(name).ok_or_else(|| ServiceError::UnknownQualityTier(name.into()))?
        }
    };

    let width = check_dimension(raw.width.unwrap_or(i64::from(DEFAULT_DIMENSION)))?;
    let height = check_dimension(raw.height.unwrap_or(i64::from(DEFAULT_DIMENSION)))?;

    let seed = match raw.seed.unwrap_or(RANDOM_SEED) {
        RANDOM_SEED => rand::thread_rng().gen_range(0..1u64 << 32),
        value if value >= 0 => value as u64,
        value => return Err(ServiceError::InvalidSeed(value)),
    };

    Ok(GenerationRequest {
        prompt: prompt.to_string(),
        negative_prompt: raw
            .negative_prompt
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string()),
        tier,
        width,
        height,
        seed,
    })
}

fn check_dimension(value: i64) -> Result<u32, ServiceError> {
    if value < i64::from(MIN_DIMENSION) || value > i64::from(MAX_DIMENSION) {
        return Err(ServiceError::OutOfRangeDimension {
            value,
            min: MIN_DIMENSION,
            max: MAX_DIMENSION,
        });
    }
    Ok(value as u32)
}
