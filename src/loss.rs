//! Soft Dice overlap between a predicted probability map and a binary mask.

use candle_core::Tensor;

pub const SMOOTH: f64 = 1.;

/// `(2 * sum(t * p) + smooth) / (sum(t) + sum(p) + smooth)` over every element
/// of the batch, as a scalar tensor.
pub fn dice_coef(y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, candle_core::Error> {
  let y_true = y_true.flatten_all()?;
  let y_pred = y_pred.flatten_all()?;

  let intersection = (&y_true * &y_pred)?.sum_all()?;
  let numerator = intersection.affine(2., SMOOTH)?;
  let denominator = ((y_true.sum_all()? + y_pred.sum_all()?)? + SMOOTH)?;

  numerator / denominator
}

pub fn dice_coef_loss(y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, candle_core::Error> {
  dice_coef(y_true, y_pred)?.neg()
}
