// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! RGBA color sources for overlay stages.
//!
//! All color types mutate in place on `set_next` and promise no internal
//! synchronization; wrap them in a mutex when sharing across threads.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

use crate::core::error::{FlowError, Result};

/// An RGBA color with components in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RgbaColor {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub alpha: f64,
}

impl RgbaColor {
    pub fn new(red: f64, green: f64, blue: f64, alpha: f64) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }
}

/// Cycles through a fixed palette of colors.
pub struct ColorPalette {
    colors: Vec<RgbaColor>,
    index: usize,
}

impl ColorPalette {
    pub fn new(colors: Vec<RgbaColor>) -> Result<Self> {
        if colors.is_empty() {
            return Err(FlowError::Configuration(
                "color palette requires at least one color".to_string(),
            ));
        }
        Ok(Self { colors, index: 0 })
    }

    pub fn current(&self) -> RgbaColor {
        self.colors[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, index: usize) -> Result<()> {
        if index >= self.colors.len() {
            return Err(FlowError::Configuration(format!(
                "palette index {index} out of range ({} colors)",
                self.colors.len()
            )));
        }
        self.index = index;
        Ok(())
    }

    /// Advance to the next color, wrapping at the end of the palette.
    pub fn set_next(&mut self) -> RgbaColor {
        self.index = (self.index + 1) % self.colors.len();
        self.current()
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

/// Draws a fresh random color on every `set_next`. Alpha stays fixed.
pub struct RandomColor {
    rng: fastrand::Rng,
    alpha: f64,
    current: RgbaColor,
}

impl RandomColor {
    pub fn new(alpha: f64) -> Self {
        Self::from_rng(fastrand::Rng::new(), alpha)
    }

    /// Seeded variant for reproducible sequences.
    pub fn with_seed(seed: u64, alpha: f64) -> Self {
        Self::from_rng(fastrand::Rng::with_seed(seed), alpha)
    }

    fn from_rng(mut rng: fastrand::Rng, alpha: f64) -> Self {
        let current = Self::draw(&mut rng, alpha);
        Self {
            rng,
            alpha,
            current,
        }
    }

    fn draw(rng: &mut fastrand::Rng, alpha: f64) -> RgbaColor {
        RgbaColor::new(rng.f64(), rng.f64(), rng.f64(), alpha)
    }

    pub fn current(&self) -> RgbaColor {
        self.current
    }

    pub fn set_next(&mut self) -> RgbaColor {
        self.current = Self::draw(&mut self.rng, self.alpha);
        self.current
    }
}

/// Pulls its next color from a client-provided callback.
///
/// A panicking provider is caught, logged, and permanently disabled; the
/// color then freezes at its last good value.
pub struct OnDemandColor {
    provider: Option<Box<dyn FnMut() -> RgbaColor + Send>>,
    current: RgbaColor,
}

impl OnDemandColor {
    pub fn new<F>(initial: RgbaColor, provider: F) -> Self
    where
        F: FnMut() -> RgbaColor + Send + 'static,
    {
        Self {
            provider: Some(Box::new(provider)),
            current: initial,
        }
    }

    pub fn current(&self) -> RgbaColor {
        self.current
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn set_next(&mut self) -> RgbaColor {
        if let Some(provider) = self.provider.as_mut() {
            match catch_unwind(AssertUnwindSafe(|| provider())) {
                Ok(color) => self.current = color,
                Err(_) => {
                    warn!("on-demand color provider panicked; disabling it");
                    self.provider = None;
                }
            }
        }
        self.current
    }
}
