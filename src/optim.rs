//! Parameter update rules and learning-rate schedules
//!
//! Both are plain values chosen by configuration: an [`UpdateRule`] applies one
//! step given parameters and their gradients, a [`LearningRateSchedule`] maps
//! an iteration index to the learning rate used for that iteration.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use serde::{Deserialize, Serialize};

/// A gradient-descent update strategy
pub trait UpdateRule {
    /// Update `parameters` in place from `grads` with the given learning rate.
    ///
    /// `parameters` must be passed in the same order on every call.
    fn step(&mut self, parameters: &[Var], grads: &GradStore, learning_rate: f64) -> Result<()>;
}

/// Maps an iteration index to a learning rate
pub trait LearningRateSchedule {
    fn next_learning_rate(&self, iteration: usize) -> f64;
}

/// Plain stochastic gradient descent
#[derive(Debug, Default)]
pub struct Sgd;

impl UpdateRule for Sgd {
    fn step(&mut self, parameters: &[Var], grads: &GradStore, learning_rate: f64) -> Result<()> {
        for var in parameters {
            if let Some(grad) = grads.get(var.as_tensor()) {
                var.set(&var.as_tensor().sub(&(grad * learning_rate)?)?)?;
            }
        }
        Ok(())
    }
}

/// Adam with bias-corrected moment estimates
#[derive(Debug)]
pub struct Adam {
    beta1: f64,
    beta2: f64,
    eps: f64,
    step_t: i32,
    /// First and second moments, aligned with the parameter slice
    moments: Vec<(Var, Var)>,
}

impl Adam {
    pub fn new(beta1: f64, beta2: f64, eps: f64) -> Self {
        Self {
            beta1,
            beta2,
            eps,
            step_t: 0,
            moments: Vec::new(),
        }
    }

    fn ensure_moments(&mut self, parameters: &[Var]) -> Result<()> {
        if self.moments.is_empty() {
            self.moments = parameters
                .iter()
                .map(|p| {
                    Ok((
                        Var::zeros(p.shape(), p.dtype(), p.device())?,
                        Var::zeros(p.shape(), p.dtype(), p.device())?,
                    ))
                })
                .collect::<Result<_>>()?;
        }
        anyhow::ensure!(
            self.moments.len() == parameters.len(),
            "Adam was initialised for {} parameters, got {}",
            self.moments.len(),
            parameters.len()
        );
        Ok(())
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.9, 0.999, 1e-8)
    }
}

impl UpdateRule for Adam {
    fn step(&mut self, parameters: &[Var], grads: &GradStore, learning_rate: f64) -> Result<()> {
        self.ensure_moments(parameters)?;
        self.step_t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step_t);
        let bias2 = 1.0 - self.beta2.powi(self.step_t);

        for (var, (m, v)) in parameters.iter().zip(&self.moments) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let next_m = ((m.as_tensor() * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            let next_v = ((v.as_tensor() * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;
            let m_hat = (&next_m / bias1)?;
            let v_hat = (&next_v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
            let next_theta = var.as_tensor().sub(&(update * learning_rate)?)?;

            m.set(&next_m)?;
            v.set(&next_v)?;
            var.set(&next_theta)?;
        }
        Ok(())
    }
}

/// Fixed learning rate
#[derive(Debug, Clone)]
pub struct ConstantSchedule {
    pub learning_rate: f64,
}

impl LearningRateSchedule for ConstantSchedule {
    fn next_learning_rate(&self, _iteration: usize) -> f64 {
        self.learning_rate
    }
}

/// Linear ramp of a multiplicative factor from `start_factor` to `end_factor`
/// over `total_iters` iterations, constant afterwards
#[derive(Debug, Clone)]
pub struct LinearSchedule {
    pub base_learning_rate: f64,
    pub start_factor: f64,
    pub end_factor: f64,
    pub total_iters: usize,
}

impl LearningRateSchedule for LinearSchedule {
    fn next_learning_rate(&self, iteration: usize) -> f64 {
        let progress = if self.total_iters == 0 {
            1.0
        } else {
            iteration.min(self.total_iters) as f64 / self.total_iters as f64
        };
        let factor = self.start_factor + (self.end_factor - self.start_factor) * progress;
        self.base_learning_rate * factor
    }
}

/// Update-rule selection with its hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
    },
    Sgd {
        lr: f64,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            lr: 5e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn base_learning_rate(&self) -> f64 {
        match self {
            Self::Adam { lr, .. } | Self::Sgd { lr } => *lr,
        }
    }

    pub fn build(&self) -> Box<dyn UpdateRule> {
        match *self {
            Self::Adam {
                beta1, beta2, eps, ..
            } => Box::new(Adam::new(beta1, beta2, eps)),
            Self::Sgd { .. } => Box::new(Sgd),
        }
    }
}

/// Learning-rate schedule selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Constant,
    Linear {
        start_factor: f64,
        end_factor: f64,
        total_iters: usize,
    },
}

impl Default for ScheduleConfig {
    /// Ramp from a third of the base rate to the full rate over five steps
    fn default() -> Self {
        Self::Linear {
            start_factor: 1.0 / 3.0,
            end_factor: 1.0,
            total_iters: 5,
        }
    }
}

impl ScheduleConfig {
    pub fn build(&self, base_learning_rate: f64) -> Box<dyn LearningRateSchedule> {
        match *self {
            Self::Constant => Box::new(ConstantSchedule {
                learning_rate: base_learning_rate,
            }),
            Self::Linear {
                start_factor,
                end_factor,
                total_iters,
            } => Box::new(LinearSchedule {
                base_learning_rate,
                start_factor,
                end_factor,
                total_iters,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_linear_schedule_ramp() {
        let schedule = ScheduleConfig::default().build(0.3);
        assert!((schedule.next_learning_rate(0) - 0.1).abs() < 1e-12);
        assert!((schedule.next_learning_rate(5) - 0.3).abs() < 1e-12);
        assert!((schedule.next_learning_rate(500) - 0.3).abs() < 1e-12);
        let mid = schedule.next_learning_rate(2);
        assert!(mid > 0.1 && mid < 0.3);
    }

    #[test]
    fn test_constant_schedule() {
        let schedule = ScheduleConfig::Constant.build(0.01);
        assert_eq!(schedule.next_learning_rate(0), 0.01);
        assert_eq!(schedule.next_learning_rate(1000), 0.01);
    }

    #[test]
    fn test_optimizer_config_serde() {
        let json = serde_json::to_string(&OptimizerConfig::default()).unwrap();
        assert!(json.contains("\"kind\":\"adam\""));
        let parsed: OptimizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, OptimizerConfig::default());
    }

    /// Minimise (x - 3)^2 and check both rules move toward the optimum
    fn descend(rule: &mut dyn UpdateRule, lr: f64, steps: usize) -> f32 {
        let x = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let params = vec![x.clone()];
        for _ in 0..steps {
            let loss = (x.as_tensor() - 3.0).unwrap().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            rule.step(&params, &grads, lr).unwrap();
        }
        let value: Vec<f32> = x.as_tensor().to_vec1().unwrap();
        value[0]
    }

    #[test]
    fn test_sgd_descends() {
        let x = descend(&mut Sgd, 0.1, 100);
        assert!((x - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_adam_descends() {
        let x = descend(&mut Adam::default(), 0.1, 300);
        assert!((x - 3.0).abs() < 0.05);
    }

    #[test]
    fn test_adam_rejects_changed_parameter_list() {
        let a = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let b = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let mut adam = Adam::default();
        let loss = Tensor::sum_all(a.as_tensor()).unwrap();
        let grads = loss.backward().unwrap();
        adam.step(&[a.clone()], &grads, 0.1).unwrap();
        assert!(adam.step(&[a, b], &grads, 0.1).is_err());
    }
}
