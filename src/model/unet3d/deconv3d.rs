use candle_core::{Module, Tensor};
use candle_nn::{init, VarBuilder};

use super::{conv3d::glorot_uniform, LevelShape};
use crate::utils::TensorExt;

/// Learned upsampling: a transpose convolution with kernel and stride equal
/// to the pooling factor.
#[derive(Debug, Clone)]
pub struct ConvTranspose3d {
  weight: Tensor,
  bias: Option<Tensor>,
  output_shape: LevelShape,
  input_shape: LevelShape,
}

impl ConvTranspose3d {
  pub fn new(
    weight: Tensor,
    bias: Option<Tensor>,
    output_shape: LevelShape,
    input_shape: LevelShape,
  ) -> Self {
    Self {
      weight,
      bias,
      output_shape,
      input_shape,
    }
  }

  pub fn weight(&self) -> &Tensor {
    &self.weight
  }

  pub fn output_shape(&self) -> LevelShape {
    self.output_shape
  }

  pub fn input_shape(&self) -> LevelShape {
    self.input_shape
  }
}

impl Module for ConvTranspose3d {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    x.conv_transpose3d_strided(&self.weight, self.bias.as_ref())
  }
}

pub fn conv_transpose3d(
  in_channels: usize,
  out_channels: usize,
  stride: [usize; 3],
  output_shape: LevelShape,
  input_shape: LevelShape,
  vb: VarBuilder,
) -> Result<ConvTranspose3d, candle_core::Error> {
  let [kx, ky, kz] = stride;

  let receptive_field = kx * ky * kz;

  let weight = vb.get_with_hints(
    (in_channels, out_channels, kx, ky, kz),
    "weight",
    glorot_uniform(in_channels * receptive_field, out_channels * receptive_field),
  )?;

  let bias = vb.get_with_hints(out_channels, "bias", init::Init::Const(0.))?;

  tracing::debug!(
    "Transpose convolution {:?} -> {:?}",
    input_shape.spatial,
    output_shape.spatial
  );

  Ok(ConvTranspose3d::new(
    weight,
    Some(bias),
    output_shape,
    input_shape,
  ))
}
