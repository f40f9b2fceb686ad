mod registry;
mod strategy;

pub use registry::{ModelCatalog, ModelSpec};
pub use strategy::{
    refine_strategy, resolve_strategy, ModelStrategy, STABILITY_PREFIX, TITAN_IMAGE_PREFIX,
    TITAN_IMAGE_V1, TITAN_IMAGE_V2,
};
