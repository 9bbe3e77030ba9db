mod cli;
mod setup;

use candle_core::{DType, Device, Tensor};
use clap::Parser;
use unet3d_rs::{Result, Simple3DModel};

use crate::{
  cli::Cli,
  setup::{setup_args, setup_tracing},
};

fn main() -> Result<()> {
  setup_tracing();

  let args = Cli::parse();
  let config = setup_args(&args)?;

  let device = if args.use_cpu {
    Device::Cpu
  } else {
    Device::cuda_if_available(0)?
  };

  let model = Simple3DModel::with_config(&config, &device)?;
  let compiled = model.model();

  for level in compiled.network().level_shapes() {
    tracing::info!(
      "{:>10} depth {}: {} channels, {:?}",
      level.name,
      level.depth,
      level.channels,
      level.spatial
    );
  }

  tracing::info!(
    "Compiled with Adam (lr = {}), loss = dice_coef_loss",
    compiled.learning_rate()
  );

  if args.dry_run {
    let x = Tensor::zeros(config.input_shape.batch_dims(1), DType::F32, &device)?;
    let y = compiled.predict(&x)?;
    tracing::info!("Dry run output: {:?}", y.shape());
  }

  Ok(())
}
