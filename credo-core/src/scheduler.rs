//! Epoch-level learning-rate schedules.
//!
//! The trainer calls [`LrScheduler::next_lr`] once at the end of every epoch
//! and hands the result to the optimizer.

use crate::error::{CredoError, Result};
use std::f64::consts::PI;

/// Produces the learning rate for the next epoch.
pub trait LrScheduler {
    /// `completed_epochs` counts from 1. `current_lr` is the optimizer's rate
    /// during the epoch that just finished.
    fn next_lr(&mut self, completed_epochs: usize, current_lr: f64) -> f64;
}

/// Multiply the rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    step_size: usize,
    gamma: f64,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f64) -> Result<Self> {
        if step_size == 0 {
            return Err(CredoError::config("StepLr step_size must be at least 1"));
        }
        if !(gamma.is_finite() && gamma > 0.0) {
            return Err(CredoError::config(format!(
                "StepLr gamma must be positive, got {gamma}"
            )));
        }
        Ok(Self { step_size, gamma })
    }
}

impl LrScheduler for StepLr {
    fn next_lr(&mut self, completed_epochs: usize, current_lr: f64) -> f64 {
        if completed_epochs % self.step_size == 0 {
            current_lr * self.gamma
        } else {
            current_lr
        }
    }
}

/// `base_lr * factor(epoch)`, where `base_lr` is the rate seen on the first
/// call.
pub struct LambdaLr {
    factor: Box<dyn Fn(usize) -> f64 + Send>,
    base_lr: Option<f64>,
}

impl LambdaLr {
    pub fn new(factor: impl Fn(usize) -> f64 + Send + 'static) -> Self {
        Self {
            factor: Box::new(factor),
            base_lr: None,
        }
    }
}

impl LrScheduler for LambdaLr {
    fn next_lr(&mut self, completed_epochs: usize, current_lr: f64) -> f64 {
        let base = *self.base_lr.get_or_insert(current_lr);
        base * (self.factor)(completed_epochs)
    }
}

/// Cosine decay from the initial rate to `lr_min` over `total_epochs`.
#[derive(Debug, Clone, Copy)]
pub struct CosineLr {
    total_epochs: usize,
    lr_min: f64,
    base_lr: Option<f64>,
}

impl CosineLr {
    pub fn new(total_epochs: usize, lr_min: f64) -> Result<Self> {
        if total_epochs == 0 {
            return Err(CredoError::config("CosineLr total_epochs must be at least 1"));
        }
        if !(lr_min.is_finite() && lr_min >= 0.0) {
            return Err(CredoError::config(format!(
                "CosineLr lr_min must be non-negative, got {lr_min}"
            )));
        }
        Ok(Self {
            total_epochs,
            lr_min,
            base_lr: None,
        })
    }
}

impl LrScheduler for CosineLr {
    fn next_lr(&mut self, completed_epochs: usize, current_lr: f64) -> f64 {
        let base = *self.base_lr.get_or_insert(current_lr);
        let progress = (completed_epochs as f64 / self.total_epochs as f64).min(1.0);
        self.lr_min + 0.5 * (base - self.lr_min) * (1.0 + (PI * progress).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lr_decays_on_boundaries() {
        let mut s = StepLr::new(2, 0.5).unwrap();
        let mut lr = 1.0;
        let mut seen = Vec::new();
        for epoch in 1..=4 {
            lr = s.next_lr(epoch, lr);
            seen.push(lr);
        }
        assert_eq!(seen, vec![1.0, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn test_degenerate_schedules_are_config_errors() {
        assert!(StepLr::new(0, 0.5).unwrap_err().is_config());
        assert!(StepLr::new(2, 0.0).unwrap_err().is_config());
        assert!(CosineLr::new(0, 0.0).unwrap_err().is_config());
        assert!(CosineLr::new(4, -1.0).unwrap_err().is_config());
    }

    #[test]
    fn test_lambda_lr_uses_first_rate_as_base() {
        let mut s = LambdaLr::new(|epoch| 1.0 / (epoch as f64 + 1.0));
        assert_eq!(s.next_lr(1, 0.2), 0.1);
        assert_eq!(s.next_lr(3, 0.1), 0.05);
    }

    #[test]
    fn test_cosine_reaches_minimum() {
        let mut s = CosineLr::new(4, 0.0).unwrap();
        let first = s.next_lr(1, 1.0);
        assert!(first < 1.0 && first > 0.5);
        let last = s.next_lr(4, first);
        assert!(last.abs() < 1e-12);
    }
}
