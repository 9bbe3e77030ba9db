use clap::Parser;
use unet3d_rs::{config::parse_pool_size, InputShape, DATA_SHAPE};

#[derive(Parser)]
#[command(version, author)]
#[command(about = "Build a 3D U-Net for lung segmentation", long_about = None)]
pub struct Cli {
  #[arg(short, long, help = "Input volume shape as x,y,z,channels")]
  #[arg(value_name = "SHAPE", default_value_t = DATA_SHAPE)]
  #[arg(value_parser = parse_shape)]
  pub shape: InputShape,

  #[arg(
    short,
    long,
    help = "Divide every filter count by this factor to reduce memory usage"
  )]
  #[arg(value_name = "FACTOR", default_value = "1.0")]
  pub downsize_filters_factor: f64,

  #[arg(short, long, help = "Max pooling factor per axis as a,b,c")]
  #[arg(value_name = "POOL", default_value = "2,2,2")]
  #[arg(value_parser = parse_pool)]
  pub pool_size: [usize; 3],

  #[arg(short, long, help = "Number of binary labels to predict")]
  #[arg(value_name = "LABELS", default_value = "1")]
  pub n_labels: usize,

  #[arg(short, long, help = "Initial learning rate of the optimizer")]
  #[arg(value_name = "LR", default_value = "0.01")]
  pub learning_rate: f64,

  #[arg(
    long,
    help = "Use transpose convolutions instead of upsampling in the decoder"
  )]
  pub deconvolution: bool,

  #[arg(short = 'C', long, help = "Use CPU instead of GPU")]
  pub use_cpu: bool,

  #[arg(long, help = "Run one forward pass on an empty volume")]
  pub dry_run: bool,
}

fn parse_shape(s: &str) -> Result<InputShape, String> {
  s.parse().map_err(|err: unet3d_rs::Error| err.to_string())
}

fn parse_pool(s: &str) -> Result<[usize; 3], String> {
  parse_pool_size(s).map_err(|err| err.to_string())
}
