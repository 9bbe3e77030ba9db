//! 3D U-Net for volumetric lung segmentation, built on candle.

pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod utils;

pub use config::{InputShape, UNet3dConfig, DATA_SHAPE};
pub use error::{Error, Result};
pub use model::{unet_model_3d, CompiledModel, SegmentationModel, Simple3DModel, UNet3d};
