//! Optimizer contract and built-in update rules
//!
//! The synchronization engine treats the numeric update rule as opaque: an
//! optimizer is anything that can apply a gradient slice to a parameter
//! slice in place, with a scale factor for batch-size normalization. Every
//! shard owns its own optimizer instance (stateful rules keep per-shard
//! moment buffers), so instances come from a factory.

use std::sync::Arc;

/// In-place parameter update rule.
///
/// `scale` carries batch-weight normalization and defaults to 1.0 at call
/// sites that have no weighting.
pub trait Optimizer: Send {
    fn apply(&mut self, params: &mut [f32], grad: &[f32], scale: f32);
}

/// Produces one optimizer instance per shard
pub type OptimizerFactory = Arc<dyn Fn() -> Box<dyn Optimizer> + Send + Sync>;

/// Wrap a constructor closure into an [`OptimizerFactory`]
pub fn factory<O, F>(make: F) -> OptimizerFactory
where
    O: Optimizer + 'static,
    F: Fn() -> O + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()))
}

/// Plain stochastic gradient descent: `p -= lr * scale * g`
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn apply(&mut self, params: &mut [f32], grad: &[f32], scale: f32) {
        let step = self.lr * scale;
        for (p, g) in params.iter_mut().zip(grad.iter()) {
            *p -= step * g;
        }
    }
}

/// AdamW configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f32,
    /// Beta1 (first moment decay)
    pub beta1: f32,
    /// Beta2 (second moment decay)
    pub beta2: f32,
    /// Epsilon for numerical stability
    pub eps: f32,
    /// Weight decay coefficient
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl AdamWConfig {
    /// Create config from learning rate with default betas
    pub fn with_lr(lr: f32) -> Self {
        Self {
            lr,
            ..Default::default()
        }
    }
}

/// AdamW over flat parameter slices with per-instance moment buffers.
///
/// For each parameter θ with gradient g:
/// ```text
/// m = β₁ * m + (1 - β₁) * g           # Update biased first moment
/// v = β₂ * v + (1 - β₂) * g²          # Update biased second moment
/// m̂ = m / (1 - β₁ᵗ)                   # Bias-corrected first moment
/// v̂ = v / (1 - β₂ᵗ)                   # Bias-corrected second moment
/// θ = θ - lr * (m̂ / (√v̂ + ε) + λ * θ) # Update with weight decay
/// ```
///
/// Moment buffers are sized lazily on the first call, so one factory serves
/// shards of different sizes.
pub struct AdamW {
    config: AdamWConfig,
    m: Vec<f32>,
    v: Vec<f32>,
    step_count: u32,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            m: Vec::new(),
            v: Vec::new(),
            step_count: 0,
        }
    }

    /// Current step count (used for bias correction)
    pub fn step_count(&self) -> u32 {
        self.step_count
    }
}

impl Optimizer for AdamW {
    fn apply(&mut self, params: &mut [f32], grad: &[f32], scale: f32) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
        }

        self.step_count += 1;
        let t = self.step_count as i32;
        let c = &self.config;
        let lr = c.lr * scale;

        let bias_correction1 = 1.0 - c.beta1.powi(t);
        let bias_correction2 = 1.0 - c.beta2.powi(t);

        for i in 0..params.len() {
            let g = grad[i];
            self.m[i] = c.beta1 * self.m[i] + (1.0 - c.beta1) * g;
            self.v[i] = c.beta2 * self.v[i] + (1.0 - c.beta2) * g * g;

            let m_hat = self.m[i] / bias_correction1;
            let v_hat = self.v[i] / bias_correction2;

            params[i] -= lr * (m_hat / (v_hat.sqrt() + c.eps) + c.weight_decay * params[i]);
        }
    }
}

/// L2 norm of a flat gradient
pub fn grad_norm(grad: &[f32]) -> f32 {
    grad.iter().map(|g| (*g as f64).powi(2)).sum::<f64>().sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_step() {
        let mut opt = Sgd::new(0.5);
        let mut params = vec![1.0, 2.0, 3.0];
        opt.apply(&mut params, &[1.0, 1.0, 1.0], 1.0);
        assert_eq!(params, vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn test_sgd_scale() {
        let mut opt = Sgd::new(1.0);
        let mut params = vec![1.0];
        opt.apply(&mut params, &[1.0], 0.1);
        assert!((params[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_adamw_moves_against_gradient() {
        let mut opt = AdamW::new(AdamWConfig::with_lr(0.1));
        let mut params = vec![1.0, 1.0];
        let before = params.clone();
        opt.apply(&mut params, &[1.0, 1.0], 1.0);
        assert!(params[0] < before[0]);
        assert!(params[1] < before[1]);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_adamw_resizes_lazily() {
        let mut opt = AdamW::new(AdamWConfig::default());
        let mut small = vec![1.0; 3];
        opt.apply(&mut small, &[0.5; 3], 1.0);
        assert_eq!(opt.m.len(), 3);
    }

    #[test]
    fn test_factory_yields_independent_state() {
        let make = factory(|| AdamW::new(AdamWConfig::with_lr(0.1)));
        let mut a = make();
        let b = make();
        let mut params = vec![1.0];
        a.apply(&mut params, &[1.0], 1.0);
        // `b` never stepped; its state is untouched by `a`
        drop(b);
    }

    #[test]
    fn test_grad_norm() {
        assert!((grad_norm(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }
}
