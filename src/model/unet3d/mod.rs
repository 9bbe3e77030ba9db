mod conv3d;
mod conv_block;
#[cfg(feature = "deconvolution")]
mod deconv3d;
mod unet;

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::{error::Result, utils::TensorExt};

pub use conv3d::*;
pub use conv_block::*;
#[cfg(feature = "deconvolution")]
pub use deconv3d::*;
pub use unet::*;

/// Whether the learned transpose-convolution upsampling was compiled in.
pub const fn deconvolution_available() -> bool {
  cfg!(feature = "deconvolution")
}

/// Declared output shape of a U-Net level, `(batch, channels, x, y, z)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelShape {
  pub batch: Option<usize>,
  pub filters: usize,
  pub spatial: [usize; 3],
}

/// Each level has an output shape determined by its filter count and by
/// how many pooling operations sit above it.
///
/// At depth 0 the image shape is returned unchanged, otherwise every axis is
/// divided by `pool_size * depth` and truncated. A divisor that does not fit
/// in `usize` yields 0.
pub fn compute_level_output_shape(
  filters: usize,
  depth: usize,
  pool_size: [usize; 3],
  image_shape: [usize; 3],
) -> LevelShape {
  let spatial = if depth != 0 {
    std::array::from_fn(|i| {
      pool_size[i]
        .checked_mul(depth)
        .map_or(0, |divisor| image_shape[i] / divisor)
    })
  } else {
    image_shape
  };

  LevelShape {
    batch: None,
    filters,
    spatial,
  }
}

/// Parameter-free nearest upsampling.
#[derive(Debug, Clone, Copy)]
pub struct UpSampling3d {
  size: [usize; 3],
}

impl UpSampling3d {
  pub fn new(size: [usize; 3]) -> Self {
    Self { size }
  }

  pub fn size(&self) -> [usize; 3] {
    self.size
  }
}

impl Module for UpSampling3d {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    x.upsample_nearest3d(self.size)
  }
}

pub enum UpConv {
  Simple(UpSampling3d),
  #[cfg(feature = "deconvolution")]
  Deconv(ConvTranspose3d),
}

impl UpConv {
  pub fn is_deconvolution(&self) -> bool {
    !matches!(self, UpConv::Simple(_))
  }
}

impl Module for UpConv {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    match self {
      UpConv::Simple(m) => m.forward(x),
      #[cfg(feature = "deconvolution")]
      UpConv::Deconv(m) => m.forward(x),
    }
  }
}

/// Upsampling layer that brings a decoder input from `depth + 1` up to `depth`.
pub fn get_upconv(
  depth: usize,
  nb_filters: usize,
  pool_size: [usize; 3],
  image_shape: [usize; 3],
  deconvolution: bool,
  vb: VarBuilder,
) -> Result<UpConv> {
  if !deconvolution {
    return Ok(UpConv::Simple(UpSampling3d::new(pool_size)));
  }

  deconv_upconv(depth, nb_filters, pool_size, image_shape, vb)
}

#[cfg(feature = "deconvolution")]
fn deconv_upconv(
  depth: usize,
  nb_filters: usize,
  pool_size: [usize; 3],
  image_shape: [usize; 3],
  vb: VarBuilder,
) -> Result<UpConv> {
  let output_shape = compute_level_output_shape(nb_filters, depth, pool_size, image_shape);
  let input_shape = compute_level_output_shape(nb_filters, depth + 1, pool_size, image_shape);

  Ok(UpConv::Deconv(conv_transpose3d(
    nb_filters,
    nb_filters,
    pool_size,
    output_shape,
    input_shape,
    vb,
  )?))
}

#[cfg(not(feature = "deconvolution"))]
fn deconv_upconv(
  _depth: usize,
  _nb_filters: usize,
  _pool_size: [usize; 3],
  _image_shape: [usize; 3],
  _vb: VarBuilder,
) -> Result<UpConv> {
  Err(crate::error::Error::DeconvolutionUnavailable)
}
