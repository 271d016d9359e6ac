use crate::record::{PositionRecord, ScoredPosition};
use serde::{Deserialize, Serialize};

/// Scale that maps centipawns onto the logistic curve.
pub const EVAL_SCALE: f32 = 2.878_242_5 / 400.;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Multiplier applied to the raw network output before the logistic.
    pub scale: f32,
    /// Share of the target taken from the game result when a reference score
    /// is present; the rest comes from the score.
    pub wdl_weight: f32,
    /// Exponent of the error: 2.0 is squared error.
    pub power: f32,
    /// L1 pull on active hidden units, added straight into their gradients.
    pub lasso: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            scale: EVAL_SCALE,
            wdl_weight: 0.5,
            power: 2.,
            lasso: 0.,
        }
    }
}

pub fn sigmoid(x: f32, scale: f32) -> f32 {
    1. / (1. + (-x * scale).exp())
}

/// Derivative of [`sigmoid`] in terms of its own output.
pub fn sigmoid_prime(s: f32, scale: f32) -> f32 {
    s * (1. - s) * scale
}

/// Label of one example, both parts in `[0, 1]` from the side to move's view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Target {
    pub wdl: f32,
    pub eval: Option<f32>,
}

impl Target {
    pub fn value(&self, wdl_weight: f32) -> f32 {
        match self.eval {
            Some(eval) => wdl_weight * self.wdl + (1. - wdl_weight) * eval,
            None => self.wdl,
        }
    }
}

impl LossConfig {
    /// Error of prediction `p` (already through the logistic) against `target`.
    pub fn error(&self, p: f32, target: &Target) -> f32 {
        (p - target.value(self.wdl_weight)).abs().powf(self.power)
    }

    /// `d error / d p`
    pub fn error_gradient(&self, p: f32, target: &Target) -> f32 {
        let diff = p - target.value(self.wdl_weight);
        if diff == 0. {
            return 0.;
        }
        self.power * diff.abs().powf(self.power - 1.) * diff.signum()
    }
}

/// Anything the trainer can learn from.
pub trait Example: Sync {
    fn record(&self) -> &PositionRecord;

    fn target(&self) -> Target {
        Target {
            wdl: f32::from(self.record().wdl()) / 2.,
            eval: None,
        }
    }
}

impl Example for PositionRecord {
    fn record(&self) -> &PositionRecord {
        self
    }
}

impl Example for ScoredPosition {
    fn record(&self) -> &PositionRecord {
        &self.record
    }

    fn target(&self) -> Target {
        Target {
            wdl: f32::from(self.record.wdl()) / 2.,
            eval: self.eval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_falls_back_to_wdl() {
        let t = Target { wdl: 1., eval: None };
        assert_eq!(t.value(0.5), 1.);
        let t = Target { wdl: 1., eval: Some(0.5) };
        assert_eq!(t.value(0.5), 0.75);
        assert_eq!(t.value(1.), 1.);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        for power in [2., 2.5] {
            let loss = LossConfig { power, ..LossConfig::default() };
            let t = Target { wdl: 0.5, eval: Some(0.9) };
            for p in [0.1f32, 0.4, 0.8, 0.95] {
                let h = 1e-3;
                let numeric = (loss.error(p + h, &t) - loss.error(p - h, &t)) / (2. * h);
                assert!((numeric - loss.error_gradient(p, &t)).abs() < 1e-2, "power {power} p {p}");
            }
        }
    }

    #[test]
    fn logistic_derivative() {
        let scale = 1.;
        let x = 0.3;
        let h = 1e-3;
        let numeric = (sigmoid(x + h, scale) - sigmoid(x - h, scale)) / (2. * h);
        assert!((numeric - sigmoid_prime(sigmoid(x, scale), scale)).abs() < 1e-3);
        assert_eq!(sigmoid(0., EVAL_SCALE), 0.5);
    }
}
