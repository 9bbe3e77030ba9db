//! Volumetric tensor operations built on candle's 2D primitives.
//!
//! Every method expects a channels-first `(N, C, X, Y, Z)` tensor.

use candle_core::Tensor;

pub trait TensorExt {
  /// Stride-1 convolution with zero "same" padding.
  ///
  /// `kernel` is `(C_out, C_in, kx, ky, kz)` with odd sizes and `ky == kz`.
  /// The X axis is unrolled into one `conv2d` per kernel slice.
  fn conv3d_same(
    &self,
    kernel: &Tensor,
    bias: Option<&Tensor>,
  ) -> Result<Self, candle_core::Error>
  where
    Self: Sized;

  /// Max pooling with window and stride both equal to `pool`.
  fn max_pool3d(&self, pool: [usize; 3]) -> Result<Self, candle_core::Error>
  where
    Self: Sized;

  /// Nearest-neighbour upsampling by an integer factor per axis.
  fn upsample_nearest3d(&self, scale: [usize; 3]) -> Result<Self, candle_core::Error>
  where
    Self: Sized;

  /// Transpose convolution whose stride equals its kernel size.
  ///
  /// `kernel` is `(C_in, C_out, kx, ky, kz)`.
  fn conv_transpose3d_strided(
    &self,
    kernel: &Tensor,
    bias: Option<&Tensor>,
  ) -> Result<Self, candle_core::Error>
  where
    Self: Sized;
}

impl TensorExt for Tensor {
  fn conv3d_same(
    &self,
    kernel: &Tensor,
    bias: Option<&Tensor>,
  ) -> Result<Self, candle_core::Error> {
    let (n, c, dx, dy, dz) = self.shape().dims5()?;
    let (c_out, c_in, kx, ky, kz) = kernel.shape().dims5()?;

    if c != c_in {
      return Err(
        candle_core::Error::Msg(format!(
          "conv3d expects {c_in} input channels, got {c}"
        ))
        .bt(),
      );
    }

    if kx % 2 == 0 || ky % 2 == 0 || ky != kz {
      return Err(
        candle_core::Error::Msg(format!(
          "conv3d_same needs odd kernels with ky == kz, got ({kx}, {ky}, {kz})"
        ))
        .bt(),
      );
    }

    let x = self.pad_with_zeros(2, kx / 2, kx / 2)?;

    let mut out: Option<Tensor> = None;
    for k in 0..kx {
      let slab = x
        .narrow(2, k, dx)?
        .permute((0, 2, 1, 3, 4))?
        .reshape((n * dx, c, dy, dz))?;
      let w = kernel.narrow(2, k, 1)?.squeeze(2)?.contiguous()?;
      let y = slab.conv2d(&w, ky / 2, 1, 1, 1)?;

      out = Some(match out {
        Some(acc) => (acc + y)?,
        None => y,
      });
    }

    let out = out
      .ok_or_else(|| candle_core::Error::Msg("conv3d_same with an empty kernel".to_owned()).bt())?
      .reshape((n, dx, c_out, dy, dz))?
      .permute((0, 2, 1, 3, 4))?
      .contiguous()?;

    match bias {
      Some(bias) => out.broadcast_add(&bias.reshape((1, c_out, 1, 1, 1))?),
      None => Ok(out),
    }
  }

  fn max_pool3d(&self, pool: [usize; 3]) -> Result<Self, candle_core::Error> {
    let (n, c, dx, dy, dz) = self.shape().dims5()?;
    let [px, py, pz] = pool;

    if px == 0 || py == 0 || pz == 0 {
      return Err(candle_core::Error::Msg("max_pool3d with a zero-sized window".to_owned()).bt());
    }

    let (ox, oy, oz) = (dx / px, dy / py, dz / pz);

    // Trailing voxels that do not fill a window are dropped.
    self
      .narrow(2, 0, ox * px)?
      .narrow(3, 0, oy * py)?
      .narrow(4, 0, oz * pz)?
      .reshape(vec![n, c, ox, px, oy, py, oz, pz])?
      .max(7)?
      .max(5)?
      .max(3)
  }

  fn upsample_nearest3d(&self, scale: [usize; 3]) -> Result<Self, candle_core::Error> {
    let (n, c, dx, dy, dz) = self.shape().dims5()?;
    let [sx, sy, sz] = scale;

    self
      .reshape(vec![n, c, dx, 1, dy, 1, dz, 1])?
      .broadcast_as(vec![n, c, dx, sx, dy, sy, dz, sz])?
      .reshape((n, c, dx * sx, dy * sy, dz * sz))
  }

  fn conv_transpose3d_strided(
    &self,
    kernel: &Tensor,
    bias: Option<&Tensor>,
  ) -> Result<Self, candle_core::Error> {
    let (n, c, dx, dy, dz) = self.shape().dims5()?;
    let (c_in, c_out, kx, ky, kz) = kernel.shape().dims5()?;

    if c != c_in {
      return Err(
        candle_core::Error::Msg(format!(
          "conv_transpose3d expects {c_in} input channels, got {c}"
        ))
        .bt(),
      );
    }

    // Windows do not overlap, so every input voxel expands into its own
    // `kx * ky * kz` output block through a single matmul.
    let x = self
      .permute((0, 2, 3, 4, 1))?
      .reshape((n * dx * dy * dz, c))?;
    let w = kernel.reshape((c_in, c_out * kx * ky * kz))?;

    let out = x
      .matmul(&w)?
      .reshape(vec![n, dx, dy, dz, c_out, kx, ky, kz])?
      .permute(vec![0, 4, 1, 5, 2, 6, 3, 7])?
      .reshape((n, c_out, dx * kx, dy * ky, dz * kz))?;

    match bias {
      Some(bias) => out.broadcast_add(&bias.reshape((1, c_out, 1, 1, 1))?),
      None => Ok(out),
    }
  }
}
