use candle_core::{Module, Tensor};
use candle_nn::{seq, Activation, Sequential, VarBuilder};

use super::conv3d;

/// Two 3x3x3 ReLU convolutions, the building block of every U-Net level.
pub struct ConvBlock {
  conv: Sequential,
  filters: [usize; 2],
}

impl ConvBlock {
  pub fn new(
    in_channels: usize,
    mid_channels: usize,
    out_channels: usize,
    vb: VarBuilder,
  ) -> Result<Self, candle_core::Error> {
    let mut conv = seq();

    conv = conv.add(conv3d(in_channels, mid_channels, 3, vb.pp("conv.0"))?);
    conv = conv.add(Activation::Relu);
    conv = conv.add(conv3d(mid_channels, out_channels, 3, vb.pp("conv.2"))?);
    conv = conv.add(Activation::Relu);

    Ok(Self {
      conv,
      filters: [mid_channels, out_channels],
    })
  }

  /// Filter counts of the two convolutions.
  pub fn filters(&self) -> [usize; 2] {
    self.filters
  }

  pub fn out_channels(&self) -> usize {
    self.filters[1]
  }
}

impl Module for ConvBlock {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    self.conv.forward(x)
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device, Module, Tensor};
  use candle_nn::{VarBuilder, VarMap};

  use super::ConvBlock;

  #[test]
  fn output_is_rectified() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let block = ConvBlock::new(1, 3, 6, vb).unwrap();
    assert_eq!(block.filters(), [3, 6]);
    assert_eq!(varmap.all_vars().len(), 4);

    let x = Tensor::randn(0f32, 1., (2, 1, 4, 4, 4), &device).unwrap();
    let y = block.forward(&x).unwrap();
    assert_eq!(y.dims(), &[2, 6, 4, 4, 4]);

    let min = y.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
    assert!(min >= 0.);
  }
}
