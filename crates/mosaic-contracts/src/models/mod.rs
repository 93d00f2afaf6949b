mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, STITCH_CAPABILITY};
pub use selectors::{ModelSelection, ModelSelector};
