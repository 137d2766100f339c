mod bundle;
mod engine;
mod preprocess;
mod rvm;
mod session;
mod single;
pub mod types;
mod worker;

pub use bundle::{Architecture, Normalization, ResourceBundle, TensorLayout};
pub use engine::{SegmentationEngine, SharedMask};
pub use preprocess::Preprocessor;
pub use rvm::RobustVideoMatting;
pub use single::SingleOutputSegmenter;
pub use types::SegmentationModel;
pub use worker::InferenceWorker;

use anyhow::Result;

/// Build the model backend the bundle asks for
pub fn create_model(bundle: &ResourceBundle) -> Result<Box<dyn SegmentationModel>> {
    let model: Box<dyn SegmentationModel> = match bundle.architecture {
        Architecture::Rvm => Box::new(RobustVideoMatting::new(bundle)?),
        Architecture::SingleOutput => Box::new(SingleOutputSegmenter::new(bundle)?),
    };
    Ok(model)
}
