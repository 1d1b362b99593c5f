use std::time::Instant;

use image::RgbImage;

use crate::error::ServiceError;
use crate::memory::ResidencyController;
use crate::model::RenderParams;
use crate::request::GenerationRequest;

/// Runs one validated job against the current placement. Resolves the
/// quality tier to its step count and hands the pipeline a fully concrete
/// parameter set; the output is deterministic for identical inputs, which is
/// the reproducibility guarantee the seed parameter exposes to callers.
///
/// Placement is read, never transitioned, here: if the model is unloaded the
/// caller gets `PlacementRequired` and is responsible for resolving it.
pub fn run_job(
    controller: &mut ResidencyController,
    request: &GenerationRequest,
) -> Result<RgbImage, ServiceError> {
    let params = RenderParams {
        prompt: request.prompt.clone(),
        negative_prompt: request.negative_prompt.clone(),
        width: request.width,
        height: request.height,
        steps: request.tier.steps(),
        seed: request.seed,
    };

    let started = Instant::now();
    let image = controller.render(&params)?;
    tracing::info!(
        steps = params.steps,
        width = params.width,
        height = params.height,
        seed = params.seed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "image rendered"
    );
    Ok(image)
}
