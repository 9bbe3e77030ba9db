use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use unet3d_rs::{Result, UNet3dConfig};

use crate::cli::Cli;

/// Volumes above this many voxels make a dry run slow on most machines.
const DRY_RUN_WARN_VOXELS: usize = 128 * 128 * 128;

pub fn setup_tracing() {
  let subscriber = FmtSubscriber::builder()
    .with_max_level(Level::INFO)
    .with_target(false)
    .finish();

  tracing::subscriber::set_global_default(subscriber).expect("Setting default subscriber failed");
}

pub fn setup_args(args: &Cli) -> Result<UNet3dConfig> {
  let config = UNet3dConfig::new(args.shape)
    .with_downsize_filters_factor(args.downsize_filters_factor)
    .with_pool_size(args.pool_size)
    .with_n_labels(args.n_labels)
    .with_initial_learning_rate(args.learning_rate)
    .with_deconvolution(args.deconvolution);

  config.validate()?;

  let too_large = args
    .shape
    .voxels()
    .map_or(true, |voxels| voxels > DRY_RUN_WARN_VOXELS);

  if args.dry_run && too_large {
    tracing::warn!(
      "Dry run on a {} volume may need a lot of memory, consider a larger downsize factor",
      args.shape
    );
  }

  Ok(config)
}
