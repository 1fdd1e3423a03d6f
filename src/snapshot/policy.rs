//! Validation policy: which outcomes let a snapshot publish

use crate::snapshot::state::{EnvOutcome, EnvStatus, LayerOutcome, LayerStatus};

/// Layer status from the number of its nodes that built and failed
pub fn layer_status(total: usize, failed: usize) -> LayerStatus {
    if failed == 0 {
        LayerStatus::Succeeded
    } else if failed >= total {
        LayerStatus::Failed
    } else {
        LayerStatus::Partial
    }
}

fn layer_acceptable(layer: &LayerOutcome, best_effort: bool) -> bool {
    match layer.status {
        LayerStatus::Succeeded => true,
        LayerStatus::Partial => best_effort,
        LayerStatus::Failed | LayerStatus::Skipped | LayerStatus::Pending => false,
    }
}

/// Required layers decide pass or fail; optional layers only degrade
/// the environment to partial
pub fn evaluate_env(layers: &[LayerOutcome], best_effort: bool) -> EnvStatus {
    let mut degraded = false;
    for layer in layers {
        if layer_acceptable(layer, best_effort) {
            degraded |= layer.status == LayerStatus::Partial;
            continue;
        }
        if layer.required {
            return EnvStatus::Failed;
        }
        degraded = true;
    }
    if degraded {
        EnvStatus::Partial
    } else {
        EnvStatus::Succeeded
    }
}

/// A snapshot publishes when no required environment failed
pub fn snapshot_passes<'a>(envs: impl IntoIterator<Item = &'a EnvOutcome>) -> bool {
    envs.into_iter()
        .all(|env| !env.required || env.status != EnvStatus::Failed)
}
