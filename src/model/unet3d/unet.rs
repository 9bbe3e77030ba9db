use candle_core::{Module, Tensor};
use candle_nn::{ops::sigmoid, VarBuilder};

use super::{conv3d, deconvolution_available, get_upconv, Conv3d, ConvBlock, UpConv};
use crate::{
  config::UNet3dConfig,
  error::{Error, Result},
  utils::TensorExt,
};

/// Analytic shape of one level's output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSummary {
  pub name: &'static str,
  pub depth: usize,
  pub channels: usize,
  pub spatial: [usize; 3],
}

/// Four-level encoder, three-level decoder with skip connections and a
/// per-voxel sigmoid head.
pub struct UNet3d {
  conv1: ConvBlock,
  conv2: ConvBlock,
  conv3: ConvBlock,
  conv4: ConvBlock,
  up5: UpConv,
  conv5: ConvBlock,
  up6: UpConv,
  conv6: ConvBlock,
  up7: UpConv,
  conv7: ConvBlock,
  conv8: Conv3d,
  pool_size: [usize; 3],
  levels: Vec<LevelSummary>,
}

impl UNet3d {
  pub fn new(config: &UNet3dConfig, vb: VarBuilder) -> Result<Self> {
    config.validate()?;

    if config.deconvolution && !deconvolution_available() {
      return Err(Error::DeconvolutionUnavailable);
    }

    let f = |base| config.filters(base);
    let in_channels = config.input_shape.channels;
    let image_shape = config.input_shape.spatial();
    let pool_size = config.pool_size;
    let deconv = config.deconvolution;

    let conv1 = ConvBlock::new(in_channels, f(32), f(64), vb.pp("conv1"))?;
    let conv2 = ConvBlock::new(f(64), f(64), f(128), vb.pp("conv2"))?;
    let conv3 = ConvBlock::new(f(128), f(128), f(256), vb.pp("conv3"))?;
    let conv4 = ConvBlock::new(f(256), f(256), f(512), vb.pp("conv4"))?;

    let up5 = get_upconv(2, f(512), pool_size, image_shape, deconv, vb.pp("up5"))?;
    let conv5 = ConvBlock::new(f(512) + f(256), f(256), f(256), vb.pp("conv5"))?;

    let up6 = get_upconv(1, f(256), pool_size, image_shape, deconv, vb.pp("up6"))?;
    let conv6 = ConvBlock::new(f(256) + f(128), f(128), f(128), vb.pp("conv6"))?;

    let up7 = get_upconv(0, f(128), pool_size, image_shape, deconv, vb.pp("up7"))?;
    let conv7 = ConvBlock::new(f(128) + f(64), f(64), f(64), vb.pp("conv7"))?;

    let conv8 = conv3d(f(64), config.n_labels, 1, vb.pp("conv8"))?;

    let spatial_at = |depth: usize| -> [usize; 3] {
      std::array::from_fn(|i| (0..depth).fold(image_shape[i], |size, _| size / pool_size[i]))
    };

    let levels = vec![
      LevelSummary {
        name: "encoder",
        depth: 0,
        channels: conv1.out_channels(),
        spatial: spatial_at(0),
      },
      LevelSummary {
        name: "encoder",
        depth: 1,
        channels: conv2.out_channels(),
        spatial: spatial_at(1),
      },
      LevelSummary {
        name: "encoder",
        depth: 2,
        channels: conv3.out_channels(),
        spatial: spatial_at(2),
      },
      LevelSummary {
        name: "bottleneck",
        depth: 3,
        channels: conv4.out_channels(),
        spatial: spatial_at(3),
      },
      LevelSummary {
        name: "decoder",
        depth: 2,
        channels: conv5.out_channels(),
        spatial: spatial_at(2),
      },
      LevelSummary {
        name: "decoder",
        depth: 1,
        channels: conv6.out_channels(),
        spatial: spatial_at(1),
      },
      LevelSummary {
        name: "decoder",
        depth: 0,
        channels: conv7.out_channels(),
        spatial: spatial_at(0),
      },
      LevelSummary {
        name: "output",
        depth: 0,
        channels: conv8.out_channels(),
        spatial: spatial_at(0),
      },
    ];

    Ok(Self {
      conv1,
      conv2,
      conv3,
      conv4,
      up5,
      conv5,
      up6,
      conv6,
      up7,
      conv7,
      conv8,
      pool_size,
      levels,
    })
  }

  /// Filter count of every 3x3x3 convolution in graph order.
  pub fn conv_filters(&self) -> Vec<usize> {
    [
      &self.conv1,
      &self.conv2,
      &self.conv3,
      &self.conv4,
      &self.conv5,
      &self.conv6,
      &self.conv7,
    ]
    .into_iter()
    .flat_map(ConvBlock::filters)
    .collect()
  }

  pub fn level_shapes(&self) -> &[LevelSummary] {
    &self.levels
  }

  /// Upsampling layers from the deepest decoder level to the shallowest.
  pub fn upconvs(&self) -> [&UpConv; 3] {
    [&self.up5, &self.up6, &self.up7]
  }

  pub fn n_labels(&self) -> usize {
    self.conv8.out_channels()
  }
}

impl Module for UNet3d {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let conv1 = self.conv1.forward(x)?;
    let pool1 = conv1.max_pool3d(self.pool_size)?;

    let conv2 = self.conv2.forward(&pool1)?;
    let pool2 = conv2.max_pool3d(self.pool_size)?;

    let conv3 = self.conv3.forward(&pool2)?;
    tracing::debug!("conv3: {:?}", conv3.shape());
    let pool3 = conv3.max_pool3d(self.pool_size)?;

    let conv4 = self.conv4.forward(&pool3)?;
    tracing::debug!("conv4: {:?}", conv4.shape());

    let up5 = self.up5.forward(&conv4)?;
    tracing::debug!("up5: {:?}", up5.shape());
    let conv5 = self.conv5.forward(&concat_skip(&up5, &conv3, 2)?)?;

    let up6 = self.up6.forward(&conv5)?;
    let conv6 = self.conv6.forward(&concat_skip(&up6, &conv2, 1)?)?;

    let up7 = self.up7.forward(&conv6)?;
    let conv7 = self.conv7.forward(&concat_skip(&up7, &conv1, 0)?)?;

    let conv8 = self.conv8.forward(&conv7)?;
    sigmoid(&conv8)
  }
}

/// Joins an upsampled decoder tensor with the encoder tensor of the same
/// level along the channel axis.
pub(crate) fn concat_skip(
  up: &Tensor,
  skip: &Tensor,
  depth: usize,
) -> Result<Tensor, candle_core::Error> {
  let up_dims = up.dims();
  let skip_dims = skip.dims();

  if up_dims.len() != 5 || skip_dims.len() != 5 || up_dims[2..] != skip_dims[2..] {
    return Err(
      candle_core::Error::Msg(format!(
        "skip connection at depth {depth}: upsampled {up_dims:?} does not match encoder {skip_dims:?}"
      ))
      .bt(),
    );
  }

  Tensor::cat(&[up, skip], 1)
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device, Module, Tensor};
  use candle_nn::{VarBuilder, VarMap};

  use super::{concat_skip, UNet3d};
  use crate::{
    config::{InputShape, UNet3dConfig},
    error::Error,
  };

  fn small_config() -> UNet3dConfig {
    UNet3dConfig::new(InputShape::new(16, 16, 8, 1)).with_downsize_filters_factor(16.)
  }

  fn build(config: &UNet3dConfig, varmap: &VarMap) -> Result<UNet3d, Error> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    UNet3d::new(config, vb)
  }

  #[test]
  fn output_matches_input_volume_and_labels() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config().with_n_labels(2);
    let net = build(&config, &varmap).unwrap();

    let x = Tensor::randn(0f32, 1., config.input_shape.batch_dims(2), &device).unwrap();
    let y = net.forward(&x).unwrap();
    assert_eq!(y.dims(), &[2, 2, 16, 16, 8]);

    let y = y.flatten_all().unwrap();
    let min = y.min(0).unwrap().to_scalar::<f32>().unwrap();
    let max = y.max(0).unwrap().to_scalar::<f32>().unwrap();
    assert!((0. ..=1.).contains(&min));
    assert!((0. ..=1.).contains(&max));
  }

  #[test]
  fn filter_counts_follow_downsize_factor() {
    let varmap = VarMap::new();
    let net = build(&small_config().with_downsize_filters_factor(3.), &varmap).unwrap();

    let base = [32, 64, 64, 128, 128, 256, 256, 512, 256, 256, 128, 128, 64, 64];
    let expected: Vec<usize> = base.iter().map(|b| b / 3).collect();
    assert_eq!(net.conv_filters(), expected);
    assert_eq!(net.n_labels(), 1);
  }

  #[test]
  fn full_size_filter_schedule() {
    let varmap = VarMap::new();
    let config = UNet3dConfig::new(InputShape::new(8, 8, 8, 1));
    let net = build(&config, &varmap).unwrap();

    assert_eq!(
      net.conv_filters(),
      vec![32, 64, 64, 128, 128, 256, 256, 512, 256, 256, 128, 128, 64, 64]
    );
  }

  #[test]
  fn skip_levels_share_spatial_shapes() {
    let varmap = VarMap::new();
    let net = build(&small_config(), &varmap).unwrap();
    let levels = net.level_shapes();

    let encoder: Vec<_> = levels.iter().filter(|l| l.name == "encoder").collect();
    let decoder: Vec<_> = levels.iter().filter(|l| l.name == "decoder").collect();
    assert_eq!(encoder.len(), 3);
    assert_eq!(decoder.len(), 3);

    for enc in &encoder {
      let dec = decoder.iter().find(|d| d.depth == enc.depth).unwrap();
      assert_eq!(enc.spatial, dec.spatial);
    }

    let bottleneck = levels.iter().find(|l| l.name == "bottleneck").unwrap();
    assert_eq!(bottleneck.spatial, [2, 2, 1]);
    assert_eq!(bottleneck.channels, 32);
  }

  #[test]
  fn skip_connection_rejects_mismatched_levels() {
    let device = Device::Cpu;
    let up = Tensor::zeros((1, 4, 4, 4, 4), DType::F32, &device).unwrap();
    let skip = Tensor::zeros((1, 2, 4, 4, 2), DType::F32, &device).unwrap();

    assert!(concat_skip(&up, &skip, 1).is_err());

    let skip = Tensor::zeros((1, 2, 4, 4, 4), DType::F32, &device).unwrap();
    assert_eq!(concat_skip(&up, &skip, 1).unwrap().dims(), &[1, 6, 4, 4, 4]);
  }

  #[test]
  fn rejects_volumes_not_divisible_by_pooling() {
    let varmap = VarMap::new();
    let config =
      UNet3dConfig::new(InputShape::new(12, 16, 16, 1)).with_downsize_filters_factor(16.);

    assert!(matches!(
      build(&config, &varmap),
      Err(Error::Shape {
        axis: 0,
        size: 12,
        factor: 8
      })
    ));
  }

  #[test]
  fn oversized_hyperparameters_are_errors() {
    let varmap = VarMap::new();

    let config = small_config().with_downsize_filters_factor(1e-300);
    assert!(matches!(build(&config, &varmap), Err(Error::Config(_))));

    let config = small_config().with_pool_size([4_000_000, 2, 2]);
    assert!(matches!(build(&config, &varmap), Err(Error::Config(_))));
    assert!(varmap.all_vars().is_empty());
  }

  #[test]
  fn simple_upsampling_is_the_default() {
    let varmap = VarMap::new();
    let net = build(&small_config(), &varmap).unwrap();

    assert!(net.upconvs().iter().all(|up| !up.is_deconvolution()));
  }

  #[cfg(not(feature = "deconvolution"))]
  #[test]
  fn deconvolution_fails_fast_without_the_feature() {
    let varmap = VarMap::new();
    let config = small_config().with_deconvolution(true);

    assert!(matches!(
      build(&config, &varmap),
      Err(Error::DeconvolutionUnavailable)
    ));
    assert!(varmap.all_vars().is_empty());
  }

  #[cfg(feature = "deconvolution")]
  #[test]
  fn deconvolution_keeps_output_shape() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let config = small_config().with_deconvolution(true);
    let net = build(&config, &varmap).unwrap();

    assert!(net.upconvs().iter().all(|up| up.is_deconvolution()));

    let x = Tensor::randn(0f32, 1., config.input_shape.batch_dims(1), &device).unwrap();
    assert_eq!(net.forward(&x).unwrap().dims(), &[1, 1, 16, 16, 8]);
  }
}
