use crate::{
    gradients::GradientBuffer,
    network::Network,
    simd::{F32x8, LANES},
    trainer::TrainerState,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumMode {
    /// Parameters with an exactly-zero gradient, and input rows no example
    /// touched, are left completely alone.
    #[default]
    SkipZero,
    /// Input rows catch up on the momentum decay they missed while untouched
    /// the next time they are updated; everything else is plain Adam.
    AgeAware,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub mode: MomentumMode,
    /// Keep input weights inside `[-c, c]` after every update.
    pub clamp_input: Option<f32>,
    /// Keep dense-layer weights inside `[-c, c]` after every update.
    pub clamp_dense: Option<f32>,
    /// Zero both moments whenever the learning rate changes.
    pub reset_on_lr_drop: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            mode: MomentumMode::SkipZero,
            clamp_input: None,
            clamp_dense: None,
            reset_on_lr_drop: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LrDrop {
    pub epoch: usize,
    pub rate: f32,
}

/// Learning rate per (1-based) epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LrSchedule {
    /// `initial * gamma^((epoch - 1) / every)`
    Step { initial: f32, gamma: f32, every: usize },
    /// `initial` until the first drop, then the rate of the latest drop.
    Drops { initial: f32, at: Vec<LrDrop> },
}

impl Default for LrSchedule {
    fn default() -> Self {
        LrSchedule::Drops {
            initial: 0.01,
            at: vec![
                LrDrop {
                    epoch: 20,
                    rate: 0.001,
                },
                LrDrop {
                    epoch: 21,
                    rate: 0.0001,
                },
            ],
        }
    }
}

impl LrSchedule {
    pub fn rate(&self, epoch: usize) -> f32 {
        match self {
            LrSchedule::Step {
                initial,
                gamma,
                every,
            } => initial * gamma.powi((epoch.saturating_sub(1) / (*every).max(1)) as i32),
            LrSchedule::Drops { initial, at } => at
                .iter()
                .filter(|d| d.epoch <= epoch)
                .max_by_key(|d| d.epoch)
                .map_or(*initial, |d| d.rate),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Parameters whose update came out non-finite; their moments were reset
    /// and the update dropped.
    pub skipped: usize,
}

/// Adam with per-parameter moments shaped like the network.
#[derive(Clone, Debug)]
pub struct Adam {
    pub config: AdamConfig,
    momentum: Network,
    velocity: Network,
}

/// Hyper-parameters for one step, splatted once.
#[derive(Clone, Copy)]
struct Coefficients {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    skip_zero: bool,
    clamp: f32,
}

impl Adam {
    pub fn new(net: &Network, config: AdamConfig) -> Self {
        Self {
            config,
            momentum: Network::zeroed(&net.arch),
            velocity: Network::zeroed(&net.arch),
        }
    }

    /// Zeroes both moments.
    pub fn reset(&mut self) {
        for t in self.momentum.tensors_mut() {
            t.fill(0.);
        }
        for t in self.velocity.tensors_mut() {
            t.fill(0.);
        }
    }

    #[cfg(test)]
    pub(crate) fn moments(&self) -> [&Network; 2] {
        [&self.momentum, &self.velocity]
    }

    /// Applies one update from the summed batch gradients. Bumps
    /// `state.iteration` and records when each touched input row was last
    /// updated.
    pub fn step(&mut self, net: &mut Network, grads: &GradientBuffer, state: &mut TrainerState) -> StepReport {
        state.iteration += 1;
        let now = state.iteration;
        let cfg = &self.config;
        let base = Coefficients {
            lr: state.learning_rate,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            epsilon: cfg.epsilon,
            skip_zero: cfg.mode == MomentumMode::SkipZero,
            clamp: f32::INFINITY,
        };
        let input = Coefficients {
            clamp: cfg.clamp_input.unwrap_or(f32::INFINITY),
            ..base
        };
        let dense = Coefficients {
            clamp: cfg.clamp_dense.unwrap_or(f32::INFINITY),
            ..base
        };

        let hidden = net.hidden();
        let mut skipped = 0;

        for &row in grads.touched_rows() {
            let row = row as usize;
            let m = self.momentum.feature_weights.row_mut(row, hidden);
            let v = self.velocity.feature_weights.row_mut(row, hidden);

            let age = now - state.feature_last_seen[row];
            state.feature_last_seen[row] = now;
            if cfg.mode == MomentumMode::AgeAware && age > 1 {
                let missed = (age - 1).min(i32::MAX as u64) as i32;
                let (d1, d2) = (cfg.beta1.powi(missed), cfg.beta2.powi(missed));
                m.iter_mut().for_each(|x| *x *= d1);
                v.iter_mut().for_each(|x| *x *= d2);
            }

            let w = net.feature_weights.row_mut(row, hidden);
            skipped += update_slice(w, m, v, grads.feature_row(row), input);
        }

        skipped += update_slice(
            &mut net.feature_bias,
            &mut self.momentum.feature_bias,
            &mut self.velocity.feature_bias,
            &grads.feature_bias,
            base,
        );

        for (((layer, m), v), g) in net
            .layers
            .iter_mut()
            .zip(&mut self.momentum.layers)
            .zip(&mut self.velocity.layers)
            .zip(&grads.layers)
        {
            skipped += update_slice(&mut layer.weights, &mut m.weights, &mut v.weights, &g.weights, dense);
            skipped += update_slice(&mut layer.biases, &mut m.biases, &mut v.biases, &g.biases, base);
        }

        StepReport { skipped }
    }
}

/// Returns how many parameters had to be skipped.
fn update_slice(w: &mut [f32], m: &mut [f32], v: &mut [f32], g: &[f32], c: Coefficients) -> usize {
    let split = w.len() - w.len() % LANES;
    let mut skipped = 0;

    let lr = F32x8::splat(c.lr);
    let b1 = F32x8::splat(c.beta1);
    let b2 = F32x8::splat(c.beta2);
    let mb1 = F32x8::splat(1. - c.beta1);
    let mb2 = F32x8::splat(1. - c.beta2);
    let eps = F32x8::splat(c.epsilon);
    let lo = F32x8::splat(-c.clamp);
    let hi = F32x8::splat(c.clamp);

    for i in (0..split).step_by(LANES) {
        let lanes = i..i + LANES;
        let g8 = F32x8::load(&g[lanes.clone()]);
        if c.skip_zero && g8.any_zero() {
            skipped += scalar_lanes(w, m, v, g, lanes, c);
            continue;
        }

        let m8 = F32x8::load(&m[lanes.clone()]) * b1 + mb1 * g8;
        let v8 = F32x8::load(&v[lanes.clone()]) * b2 + mb2 * g8 * g8;
        let w8 = F32x8::load(&w[lanes.clone()]) - lr * m8 / (v8.sqrt() + eps);
        if !(w8.all_finite() && m8.all_finite() && v8.all_finite()) {
            skipped += scalar_lanes(w, m, v, g, lanes, c);
            continue;
        }

        m8.store(&mut m[lanes.clone()]);
        v8.store(&mut v[lanes.clone()]);
        w8.max(lo).min(hi).store(&mut w[lanes]);
    }

    skipped + scalar_lanes(w, m, v, g, split..w.len(), c)
}

fn scalar_lanes(
    w: &mut [f32],
    m: &mut [f32],
    v: &mut [f32],
    g: &[f32],
    lanes: std::ops::Range<usize>,
    c: Coefficients,
) -> usize {
    lanes
        .filter(|&i| !update_one(&mut w[i], &mut m[i], &mut v[i], g[i], c))
        .count()
}

/// `false` when the update was non-finite and got dropped.
fn update_one(w: &mut f32, m: &mut f32, v: &mut f32, g: f32, c: Coefficients) -> bool {
    if c.skip_zero && g == 0. {
        return true;
    }

    let m_new = c.beta1 * *m + (1. - c.beta1) * g;
    let v_new = c.beta2 * *v + (1. - c.beta2) * g * g;
    let w_new = *w - c.lr * m_new / (v_new.sqrt() + c.epsilon);

    if !(w_new.is_finite() && m_new.is_finite() && v_new.is_finite()) {
        *m = 0.;
        *v = 0.;
        return false;
    }

    *m = m_new;
    *v = v_new;
    *w = w_new.clamp(-c.clamp, c.clamp);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::small_arch;

    fn coefficients(lr: f32, skip_zero: bool) -> Coefficients {
        let cfg = AdamConfig::default();
        Coefficients {
            lr,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            epsilon: cfg.epsilon,
            skip_zero,
            clamp: f32::INFINITY,
        }
    }

    #[test]
    fn constant_gradient_moves_one_way() {
        for g in [1.0f32, -0.3] {
            let (mut w, mut m, mut v) = (0.5f32, 0., 0.);
            for _ in 0..500 {
                let before = w;
                assert!(update_one(&mut w, &mut m, &mut v, g, coefficients(1e-3, true)));
                if g > 0. {
                    assert!(w < before);
                } else {
                    assert!(w > before);
                }
            }
        }
    }

    #[test]
    fn simd_path_matches_scalar_path() {
        let g: Vec<f32> = (0..19).map(|i| (i as f32 - 9.) * 0.1 + 0.05).collect();
        let mut w = vec![0.25f32; 19];
        let mut m = vec![0.01f32; 19];
        let mut v = vec![0.02f32; 19];
        let (mut ws, mut ms, mut vs) = (w.clone(), m.clone(), v.clone());

        update_slice(&mut w, &mut m, &mut v, &g, coefficients(0.01, true));
        for i in 0..19 {
            update_one(&mut ws[i], &mut ms[i], &mut vs[i], g[i], coefficients(0.01, true));
        }
        for i in 0..19 {
            assert!((w[i] - ws[i]).abs() < 1e-6);
            assert!((m[i] - ms[i]).abs() < 1e-7);
            assert!((v[i] - vs[i]).abs() < 1e-7);
        }
    }

    #[test]
    fn zero_gradient_is_left_alone() {
        let mut w = vec![1.0f32; 8];
        let mut m = vec![0.5f32; 8];
        let mut v = vec![0.25f32; 8];
        let mut g = vec![0.1f32; 8];
        g[3] = 0.;

        update_slice(&mut w, &mut m, &mut v, &g, coefficients(0.01, true));
        assert_eq!((w[3], m[3], v[3]), (1., 0.5, 0.25));
        assert!(w[0] < 1.);

        // without skipping, momentum alone still moves the weight
        update_slice(&mut w, &mut m, &mut v, &g, coefficients(0.01, false));
        assert!(w[3] < 1.);
    }

    #[test]
    fn non_finite_update_resets_moments() {
        let mut w = vec![1.0f32; 10];
        let mut m = vec![0.5f32; 10];
        let mut v = vec![0.25f32; 10];
        let mut g = vec![0.1f32; 10];
        g[2] = f32::NAN;
        g[9] = f32::INFINITY;

        let skipped = update_slice(&mut w, &mut m, &mut v, &g, coefficients(0.01, true));
        assert_eq!(skipped, 2);
        for i in [2, 9] {
            assert_eq!((w[i], m[i], v[i]), (1., 0., 0.));
        }
        assert!(w[0] < 1. && w[8] < 1.);
    }

    #[test]
    fn clamp_bounds_weights() {
        let mut c = coefficients(10., true);
        c.clamp = 1.98;
        let mut w = vec![1.9f32; 9];
        let mut m = vec![0f32; 9];
        let mut v = vec![0f32; 9];
        update_slice(&mut w, &mut m, &mut v, &[-1.; 9], c);
        assert!(w.iter().all(|&x| x == 1.98));
    }

    fn touch(grads: &mut GradientBuffer, row: usize, g: f32) {
        grads.clear();
        grads.add_to_row(row, &[g; 16]);
    }

    #[test]
    fn age_aware_rows_catch_up_on_decay() {
        let arch = small_arch();
        let mut net = Network::zeroed(&arch);
        let config = AdamConfig {
            mode: MomentumMode::AgeAware,
            ..AdamConfig::default()
        };
        let mut adam = Adam::new(&net, config.clone());
        let mut state = TrainerState::new(&arch, 0.01);
        let mut grads = GradientBuffer::new(&arch);

        touch(&mut grads, 3, 0.4);
        adam.step(&mut net, &grads, &mut state);
        let m1 = adam.momentum.feature_weights.row(3, 16)[0];
        let v1 = adam.velocity.feature_weights.row(3, 16)[0];

        for _ in 0..3 {
            touch(&mut grads, 5, 0.1);
            adam.step(&mut net, &grads, &mut state);
        }
        // untouched in the meantime
        assert_eq!(adam.momentum.feature_weights.row(3, 16)[0], m1);

        touch(&mut grads, 3, -0.2);
        adam.step(&mut net, &grads, &mut state);

        let b1 = config.beta1;
        let b2 = config.beta2;
        let expected_m = b1.powi(4) * m1 + (1. - b1) * -0.2;
        let expected_v = b2.powi(4) * v1 + (1. - b2) * 0.04;
        assert!((adam.momentum.feature_weights.row(3, 16)[0] - expected_m).abs() < 1e-7);
        assert!((adam.velocity.feature_weights.row(3, 16)[0] - expected_v).abs() < 1e-7);
        assert_eq!(state.feature_last_seen[3], 5);
        assert_eq!(state.iteration, 5);
    }

    #[test]
    fn schedules() {
        let step = LrSchedule::Step {
            initial: 0.01,
            gamma: 0.5,
            every: 10,
        };
        assert_eq!(step.rate(1), 0.01);
        assert_eq!(step.rate(10), 0.01);
        assert_eq!(step.rate(11), 0.005);
        assert_eq!(step.rate(21), 0.0025);

        let drops = LrSchedule::default();
        assert_eq!(drops.rate(1), 0.01);
        assert_eq!(drops.rate(20), 0.001);
        assert_eq!(drops.rate(22), 0.0001);
    }
}
