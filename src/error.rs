pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("Invalid configuration: {0}")]
  Config(String),

  #[error("Spatial dimension {axis} ({size}) must be divisible by {factor}")]
  Shape {
    axis: usize,
    size: usize,
    factor: usize,
  },

  #[error(
    "Enable the `deconvolution` feature in order to use deconvolution. Otherwise set deconvolution=false."
  )]
  DeconvolutionUnavailable,

  #[error("Must implement '{0}()'")]
  NotImplemented(&'static str),

  #[error(transparent)]
  Candle(#[from] candle_core::Error),
}
