use crate::intent::signals_edit_intent;

use super::registry::ModelCatalog;

pub const TITAN_IMAGE_V1: &str = "amazon.titan-image-generator-v1";
pub const TITAN_IMAGE_V2: &str = "amazon.titan-image-generator-v2:0";
pub const TITAN_IMAGE_PREFIX: &str = "amazon.titan-image";
pub const STABILITY_PREFIX: &str = "stability";

/// The request/response handling path selected for a model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStrategy {
    PlainText,
    ImageGenerate,
    ImageGenerateWithReference,
    Inpaint,
    MultimodalVision,
    Unsupported,
}

impl ModelStrategy {
    pub fn label(self) -> &'static str {
        match self {
            ModelStrategy::PlainText => "plain_text",
            ModelStrategy::ImageGenerate => "image_generate",
            ModelStrategy::ImageGenerateWithReference => "image_generate_with_reference",
            ModelStrategy::Inpaint => "inpaint",
            ModelStrategy::MultimodalVision => "multimodal_vision",
            ModelStrategy::Unsupported => "unsupported",
        }
    }
}

/// Resolves a model identifier to its strategy. Pure over the identifier
/// and the catalog; ordered rules, first match wins, most specific first.
pub fn resolve_strategy(catalog: &ModelCatalog, model_id: &str) -> ModelStrategy {
    if model_id == TITAN_IMAGE_V1 {
        return ModelStrategy::ImageGenerate;
    }
    if model_id == TITAN_IMAGE_V2 {
        return ModelStrategy::ImageGenerateWithReference;
    }
    if model_id.starts_with(TITAN_IMAGE_PREFIX) || model_id.starts_with(STABILITY_PREFIX) {
        return ModelStrategy::ImageGenerate;
    }
    if catalog.supports(model_id, "text") {
        return ModelStrategy::PlainText;
    }
    ModelStrategy::Unsupported
}

/// Applies the two context-dependent upgrades the resolver cannot see:
/// an edit-intent prompt turns a titan-v1 generate into an inpaint, and a
/// stored reference image turns a vision-capable text call into a
/// multimodal one. Pure; callers supply the reference-presence fact.
pub fn refine_strategy(
    catalog: &ModelCatalog,
    resolved: ModelStrategy,
    model_id: &str,
    prompt: &str,
    has_reference: bool,
) -> ModelStrategy {
    match resolved {
        ModelStrategy::ImageGenerate
            if model_id == TITAN_IMAGE_V1 && signals_edit_intent(prompt) =>
        {
            ModelStrategy::Inpaint
        }
        ModelStrategy::PlainText if has_reference && catalog.supports(model_id, "vision") => {
            ModelStrategy::MultimodalVision
        }
        other => other,
    }
}
