use candle_core::{Module, Tensor};
use candle_nn::{init, VarBuilder};

use crate::utils::TensorExt;

/// Cubic-kernel 3D convolution with "same" padding.
#[derive(Debug, Clone)]
pub struct Conv3d {
  weight: Tensor,
  bias: Option<Tensor>,
}

impl Conv3d {
  pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
    Self { weight, bias }
  }

  pub fn weight(&self) -> &Tensor {
    &self.weight
  }

  pub fn bias(&self) -> Option<&Tensor> {
    self.bias.as_ref()
  }

  pub fn out_channels(&self) -> usize {
    self.weight.dims()[0]
  }

  pub fn in_channels(&self) -> usize {
    self.weight.dims()[1]
  }
}

impl Module for Conv3d {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    x.conv3d_same(&self.weight, self.bias.as_ref())
  }
}

/// Glorot-uniform weights and zero bias, the usual Keras defaults.
pub fn conv3d(
  in_channels: usize,
  out_channels: usize,
  kernel_size: usize,
  vb: VarBuilder,
) -> Result<Conv3d, candle_core::Error> {
  let receptive_field = kernel_size.pow(3);

  let weight = vb.get_with_hints(
    (
      out_channels,
      in_channels,
      kernel_size,
      kernel_size,
      kernel_size,
    ),
    "weight",
    glorot_uniform(in_channels * receptive_field, out_channels * receptive_field),
  )?;

  let bias = vb.get_with_hints(out_channels, "bias", init::Init::Const(0.))?;

  Ok(Conv3d::new(weight, Some(bias)))
}

pub(crate) fn glorot_uniform(fan_in: usize, fan_out: usize) -> init::Init {
  let limit = (6. / (fan_in + fan_out) as f64).sqrt();

  init::Init::Uniform {
    lo: -limit,
    up: limit,
  }
}
