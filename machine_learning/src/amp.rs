//! Dynamic loss scaling for reduced-precision gradients.
//!
//! The loss derivative is multiplied by the current scale before the backward pass so that small
//! gradients survive storage in `f16`. After the gradients are synchronized they are unscaled
//! and checked: a non-finite value means the scale was too large, the step must be skipped and
//! the scale backs off. After `growth_interval` clean steps in a row the scale grows again.

use half::f16;
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// The numeric format gradients are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Full,
    #[default]
    Half,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// The exportable state of a `LossScaler`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    pub loss_scale: f32,
    pub stable_steps: usize,
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    precision: Precision,
    config: LossScaleConfig,
    loss_scale: f32,
    stable_steps: usize,
}

impl LossScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        let config = sanitize_config(config);

        Self {
            precision,
            loss_scale: config.initial_scale,
            stable_steps: 0,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.precision == Precision::Half
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn loss_scale(&self) -> f32 {
        if self.is_enabled() {
            self.loss_scale
        } else {
            1.0
        }
    }

    /// Scales the loss derivative that seeds the backward pass.
    pub fn scale(&self, d: &mut Array2<f32>) {
        if self.is_enabled() {
            *d *= self.loss_scale;
        }
    }

    /// Rounds the gradient through the storage format, values beyond `f16` range become infinite.
    pub fn store(&self, grad: &mut [f32]) {
        if self.is_enabled() {
            for g in grad.iter_mut() {
                *g = f16::from_f32(*g).to_f32();
            }
        }
    }

    /// Divides the gradient by the current scale.
    ///
    /// # Returns
    /// Whether a non-finite value was found, in which case the step must be skipped.
    pub fn unscale(&self, grad: &mut [f32]) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let inv = 1.0 / self.loss_scale;
        let mut found_inf = false;

        for g in grad.iter_mut() {
            *g *= inv;
            found_inf |= !g.is_finite();
        }

        found_inf
    }

    /// Adjusts the scale after a step.
    ///
    /// # Arguments
    /// * `found_inf` - Whether the step's gradient overflowed.
    pub fn update(&mut self, found_inf: bool) {
        if !self.is_enabled() {
            return;
        }

        if found_inf {
            self.loss_scale = (self.loss_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
            debug!(loss_scale = self.loss_scale; "gradient overflow, skipping step");
            return;
        }

        self.stable_steps += 1;
        if self.stable_steps >= self.config.growth_interval {
            self.loss_scale = (self.loss_scale * self.config.growth_factor).min(self.config.max_scale);
            self.stable_steps = 0;
        }
    }

    pub fn state_dict(&self) -> LossScalerState {
        LossScalerState {
            loss_scale: self.loss_scale,
            stable_steps: self.stable_steps,
        }
    }

    pub fn load_state_dict(&mut self, state: &LossScalerState) {
        self.loss_scale = state
            .loss_scale
            .clamp(self.config.min_scale, self.config.max_scale);
        self.stable_steps = state.stable_steps;
    }
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}
