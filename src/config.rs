use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// Number of max-pooling stages between the input and the bottleneck.
pub const POOL_STAGES: u32 = 3;

/// Upper bound on the filter count of any convolution.
pub const MAX_FILTERS: usize = 1 << 16;

/// Shape of one input volume, `(x, y, z, channels)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
  pub x: usize,
  pub y: usize,
  pub z: usize,
  pub channels: usize,
}

/// Volume shape produced by the lung segmentation preprocessing.
pub const DATA_SHAPE: InputShape = InputShape::new(512, 512, 1024, 1);

impl InputShape {
  pub const fn new(x: usize, y: usize, z: usize, channels: usize) -> Self {
    Self { x, y, z, channels }
  }

  pub fn spatial(&self) -> [usize; 3] {
    [self.x, self.y, self.z]
  }

  /// Number of voxels in one volume, `None` if it does not fit in `usize`.
  pub fn voxels(&self) -> Option<usize> {
    self.x.checked_mul(self.y)?.checked_mul(self.z)
  }

  /// Tensor shape of a batch in the channels-first layout the model consumes.
  pub fn batch_dims(&self, batch: usize) -> (usize, usize, usize, usize, usize) {
    (batch, self.channels, self.x, self.y, self.z)
  }
}

impl fmt::Display for InputShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{},{},{},{}", self.x, self.y, self.z, self.channels)
  }
}

impl FromStr for InputShape {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let dims = parse_dims(s)?;

    let [x, y, z, channels] = dims[..] else {
      return Err(Error::Config(format!(
        "expected `x,y,z,channels`, got {} values",
        dims.len()
      )));
    };

    Ok(Self::new(x, y, z, channels))
  }
}

pub fn parse_pool_size(s: &str) -> Result<[usize; 3]> {
  let dims = parse_dims(s)?;

  dims
    .try_into()
    .map_err(|v: Vec<usize>| Error::Config(format!("expected 3 pool factors, got {}", v.len())))
}

fn parse_dims(s: &str) -> Result<Vec<usize>> {
  s.split(',')
    .map(|v| {
      v.trim()
        .parse::<usize>()
        .map_err(|_| Error::Config(format!("`{}` is not a valid dimension", v.trim())))
    })
    .collect()
}

/// Hyperparameters of the 3D U-Net.
#[derive(Debug, Clone, PartialEq)]
pub struct UNet3dConfig {
  pub input_shape: InputShape,
  /// Every filter count is divided by this factor to trade capacity for memory.
  pub downsize_filters_factor: f64,
  pub pool_size: [usize; 3],
  pub n_labels: usize,
  pub initial_learning_rate: f64,
  /// Use learned transpose convolutions instead of nearest upsampling.
  pub deconvolution: bool,
}

impl UNet3dConfig {
  pub fn new(input_shape: InputShape) -> Self {
    Self {
      input_shape,
      downsize_filters_factor: 1.,
      pool_size: [2, 2, 2],
      n_labels: 1,
      initial_learning_rate: 0.01,
      deconvolution: false,
    }
  }

  pub fn with_downsize_filters_factor(mut self, factor: f64) -> Self {
    self.downsize_filters_factor = factor;
    self
  }

  pub fn with_pool_size(mut self, pool_size: [usize; 3]) -> Self {
    self.pool_size = pool_size;
    self
  }

  pub fn with_n_labels(mut self, n_labels: usize) -> Self {
    self.n_labels = n_labels;
    self
  }

  pub fn with_initial_learning_rate(mut self, lr: f64) -> Self {
    self.initial_learning_rate = lr;
    self
  }

  pub fn with_deconvolution(mut self, deconvolution: bool) -> Self {
    self.deconvolution = deconvolution;
    self
  }

  /// Filter count of a convolution whose full-size network uses `base` filters.
  pub fn filters(&self, base: usize) -> usize {
    (base as f64 / self.downsize_filters_factor) as usize
  }

  pub fn validate(&self) -> Result<()> {
    let factor = self.downsize_filters_factor;
    if !factor.is_finite() || factor <= 0. {
      return Err(Error::Config(format!(
        "downsize_filters_factor must be positive, got {factor}"
      )));
    }

    // 32 is the smallest filter count in the network.
    if self.filters(32) == 0 {
      return Err(Error::Config(format!(
        "downsize_filters_factor {factor} leaves the first level without filters"
      )));
    }

    // 512 is the widest level.
    if 512. / factor > MAX_FILTERS as f64 {
      return Err(Error::Config(format!(
        "downsize_filters_factor {factor} needs more than {MAX_FILTERS} filters per level"
      )));
    }

    if self.pool_size.contains(&0) {
      return Err(Error::Config("pool_size entries must be positive".to_owned()));
    }

    if self.n_labels == 0 {
      return Err(Error::Config("n_labels must be positive".to_owned()));
    }

    if self.input_shape.channels == 0 {
      return Err(Error::Config("input must have at least one channel".to_owned()));
    }

    let lr = self.initial_learning_rate;
    if !lr.is_finite() || lr <= 0. {
      return Err(Error::Config(format!(
        "initial_learning_rate must be positive, got {lr}"
      )));
    }

    for (axis, (size, pool)) in self
      .input_shape
      .spatial()
      .into_iter()
      .zip(self.pool_size)
      .enumerate()
    {
      let Some(factor) = pool.checked_pow(POOL_STAGES) else {
        return Err(Error::Config(format!(
          "pool_size {pool} on axis {axis} overflows after {POOL_STAGES} pooling stages"
        )));
      };

      if size == 0 || size % factor != 0 {
        return Err(Error::Shape { axis, size, factor });
      }
    }

    Ok(())
  }
}

impl Default for UNet3dConfig {
  fn default() -> Self {
    Self::new(DATA_SHAPE)
  }
}
