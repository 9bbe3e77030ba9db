use candle_core::{Module, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use super::UNet3d;
use crate::{
  config::UNet3dConfig,
  error::Result,
  loss::{dice_coef, dice_coef_loss},
};

/// `(y_true, y_pred) -> scalar` loss or metric.
pub type LossFn = fn(&Tensor, &Tensor) -> Result<Tensor, candle_core::Error>;

#[derive(Clone, Copy)]
pub struct Metric {
  pub name: &'static str,
  pub func: LossFn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchMetrics {
  pub loss: f32,
  pub metrics: Vec<(&'static str, f32)>,
}

impl BatchMetrics {
  pub fn get(&self, name: &str) -> Option<f32> {
    self
      .metrics
      .iter()
      .find_map(|(n, v)| (*n == name).then_some(*v))
  }
}

/// A network with its parameters, optimizer, loss and metrics attached.
pub struct CompiledModel {
  varmap: VarMap,
  network: UNet3d,
  optimizer: AdamW,
  loss: LossFn,
  metrics: Vec<Metric>,
}

impl CompiledModel {
  /// Attaches Adam, the soft Dice loss and the Dice metric to `network`,
  /// whose parameters live in `varmap`.
  pub fn compile(network: UNet3d, varmap: VarMap, config: &UNet3dConfig) -> Result<Self> {
    let optimizer = AdamW::new(
      varmap.all_vars(),
      ParamsAdamW {
        lr: config.initial_learning_rate,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-8,
        weight_decay: 0.,
      },
    )?;

    Ok(Self {
      varmap,
      network,
      optimizer,
      loss: dice_coef_loss,
      metrics: vec![Metric {
        name: "dice_coef",
        func: dice_coef,
      }],
    })
  }

  pub fn network(&self) -> &UNet3d {
    &self.network
  }

  pub fn varmap(&self) -> &VarMap {
    &self.varmap
  }

  pub fn metrics(&self) -> &[Metric] {
    &self.metrics
  }

  pub fn num_parameters(&self) -> usize {
    self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
  }

  pub fn learning_rate(&self) -> f64 {
    self.optimizer.learning_rate()
  }

  pub fn set_learning_rate(&mut self, lr: f64) {
    self.optimizer.set_learning_rate(lr)
  }

  pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
    Ok(self.network.forward(x)?)
  }

  /// Loss and metrics on one batch, without touching the parameters.
  pub fn evaluate(&self, x: &Tensor, y: &Tensor) -> Result<BatchMetrics> {
    let y_pred = self.network.forward(x)?;
    let loss = (self.loss)(y, &y_pred)?;

    self.batch_metrics(&loss, y, &y_pred)
  }

  /// One optimizer step on a single batch. The returned values are measured
  /// before the update.
  pub fn train_on_batch(&mut self, x: &Tensor, y: &Tensor) -> Result<BatchMetrics> {
    let y_pred = self.network.forward(x)?;
    let loss = (self.loss)(y, &y_pred)?;
    let metrics = self.batch_metrics(&loss, y, &y_pred)?;

    self.optimizer.backward_step(&loss)?;
    tracing::debug!("train_on_batch loss: {}", metrics.loss);

    Ok(metrics)
  }

  fn batch_metrics(&self, loss: &Tensor, y: &Tensor, y_pred: &Tensor) -> Result<BatchMetrics> {
    let metrics = self
      .metrics
      .iter()
      .map(|m| -> Result<(&'static str, f32)> {
        Ok((m.name, (m.func)(y, y_pred)?.to_scalar::<f32>()?))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(BatchMetrics {
      loss: loss.to_scalar::<f32>()?,
      metrics,
    })
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device, Tensor};

  use crate::{
    config::{InputShape, UNet3dConfig},
    model::unet_model_3d,
  };

  fn small_config() -> UNet3dConfig {
    UNet3dConfig::new(InputShape::new(8, 8, 8, 1)).with_downsize_filters_factor(16.)
  }

  fn head_bias(model: &super::CompiledModel) -> f32 {
    let data = model.varmap().data().lock().unwrap();
    data["conv8.bias"]
      .as_tensor()
      .flatten_all()
      .unwrap()
      .to_vec1::<f32>()
      .unwrap()[0]
  }

  #[test]
  fn compile_attaches_adam_and_dice() {
    let config = small_config().with_initial_learning_rate(0.005);
    let model = unet_model_3d(&config, &Device::Cpu).unwrap();

    assert_eq!(model.learning_rate(), 0.005);
    assert_eq!(model.metrics().len(), 1);
    assert_eq!(model.metrics()[0].name, "dice_coef");
    assert!(model.num_parameters() > 0);
  }

  #[test]
  fn evaluate_reports_loss_as_negative_dice() {
    let device = Device::Cpu;
    let model = unet_model_3d(&small_config(), &device).unwrap();

    let x = Tensor::randn(0f32, 1., (1, 1, 8, 8, 8), &device).unwrap();
    let y = Tensor::ones((1, 1, 8, 8, 8), DType::F32, &device).unwrap();

    let metrics = model.evaluate(&x, &y).unwrap();
    let dice = metrics.get("dice_coef").unwrap();
    assert!((metrics.loss + dice).abs() < 1e-6);
    assert!(dice > 0. && dice <= 1.);
  }

  #[test]
  fn train_on_batch_updates_parameters() {
    let device = Device::Cpu;
    let mut model = unet_model_3d(&small_config(), &device).unwrap();

    let x = Tensor::randn(0f32, 1., (1, 1, 8, 8, 8), &device).unwrap();
    let y = Tensor::ones((1, 1, 8, 8, 8), DType::F32, &device).unwrap();

    let before = head_bias(&model);
    model.train_on_batch(&x, &y).unwrap();
    let after = head_bias(&model);

    // every voxel is foreground, so the head is pushed towards higher logits
    assert!(after > before);
  }

  #[test]
  fn learning_rate_can_be_decayed() {
    let mut model = unet_model_3d(&small_config(), &Device::Cpu).unwrap();

    model.set_learning_rate(0.001);
    assert_eq!(model.learning_rate(), 0.001);
  }
}
