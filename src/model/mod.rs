mod compiled;
mod unet3d;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

pub use compiled::*;
pub use unet3d::*;

use crate::{
  config::UNet3dConfig,
  error::{Error, Result},
};

/// Training and inference obligations of a segmentation model.
pub trait SegmentationModel {
  fn fit(&mut self, x: &Tensor, y: &Tensor) -> Result<()>;

  fn predict(&self, x: &Tensor) -> Result<Tensor>;
}

/// Builds the 3D U-Net and compiles it into an untrained model.
///
/// The encoder captures context while the decoder restores localisation.
/// Memory grows quickly with the volume: raise `downsize_filters_factor` to
/// shrink every level when the input is large.
pub fn unet_model_3d(config: &UNet3dConfig, device: &Device) -> Result<CompiledModel> {
  tracing::info!(
    "Building 3D U-Net for input {} (downsize factor {}, pool {:?})",
    config.input_shape,
    config.downsize_filters_factor,
    config.pool_size
  );

  let varmap = VarMap::new();
  let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
  let network = UNet3d::new(config, vb)?;

  let model = CompiledModel::compile(network, varmap, config)?;
  tracing::info!("Model has {} parameters", model.num_parameters());

  Ok(model)
}

/// The 3D U-Net lung segmentation model.
///
/// Only the architecture is provided: `fit` and `predict` are left for a
/// concrete training setup to supply.
pub struct Simple3DModel {
  model: CompiledModel,
}

impl Simple3DModel {
  /// Builds with the lung segmentation input shape and default hyperparameters.
  pub fn new(device: &Device) -> Result<Self> {
    Self::with_config(&UNet3dConfig::default(), device)
  }

  pub fn with_config(config: &UNet3dConfig, device: &Device) -> Result<Self> {
    Ok(Self {
      model: unet_model_3d(config, device)?,
    })
  }

  pub fn model(&self) -> &CompiledModel {
    &self.model
  }

  pub fn model_mut(&mut self) -> &mut CompiledModel {
    &mut self.model
  }
}

impl SegmentationModel for Simple3DModel {
  fn fit(&mut self, _x: &Tensor, _y: &Tensor) -> Result<()> {
    Err(Error::NotImplemented("fit"))
  }

  fn predict(&self, _x: &Tensor) -> Result<Tensor> {
    Err(Error::NotImplemented("predict"))
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device, Tensor};

  use super::*;
  use crate::config::InputShape;

  fn small_config() -> UNet3dConfig {
    UNet3dConfig::new(InputShape::new(8, 8, 8, 1)).with_downsize_filters_factor(16.)
  }

  #[test]
  fn hooks_are_not_implemented() {
    let device = Device::Cpu;
    let mut model = Simple3DModel::with_config(&small_config(), &device).unwrap();

    let x = Tensor::zeros((1, 1, 8, 8, 8), DType::F32, &device).unwrap();

    let err = model.fit(&x, &x).unwrap_err();
    assert!(matches!(err, Error::NotImplemented("fit")));
    assert_eq!(err.to_string(), "Must implement 'fit()'");

    let err = SegmentationModel::predict(&model, &x).unwrap_err();
    assert!(matches!(err, Error::NotImplemented("predict")));
  }

  #[test]
  fn compiled_network_is_still_usable() {
    let device = Device::Cpu;
    let model = Simple3DModel::with_config(&small_config(), &device).unwrap();

    let x = Tensor::zeros((1, 1, 8, 8, 8), DType::F32, &device).unwrap();
    let y = model.model().predict(&x).unwrap();
    assert_eq!(y.dims(), &[1, 1, 8, 8, 8]);
  }

  #[test]
  fn invalid_config_is_reported_before_building() {
    let config = UNet3dConfig::new(InputShape::new(8, 8, 8, 0));

    assert!(matches!(
      unet_model_3d(&config, &Device::Cpu),
      Err(Error::Config(_))
    ));
  }
}
