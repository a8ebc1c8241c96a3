// Logarithmic spiral model: the mathematical core behind the score.
//
// A spiral galaxy arm is modelled as `r = a * e^(b * theta)`. Each section of
// the piece walks a stretch of angle, and the generator samples a
// `SpiralPoint` for every note it places:
// - `radius`: how far out along the arm we are (drives registral lift),
// - `density`: the density-wave intensity in [0, 1] (drives velocity and
//   ornament subdivision; a modulation input, never a gate).
// `golden_entry_offset` is the golden-ratio scaling used to stagger canonic
// entries.
//
// The density wave is a two-armed cosine bump peaking at 3*pi/4:
//   bump = ((1 + cos(arms * (theta - peak))) / 2)^sharpness
//   density = floor + (ceiling - floor) * bump
//
// Everything here is pure and total over its validated domain. `b <= 0` is
// rejected: `b = 0` collapses the spiral into a circle and negative `b`
// winds inward.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{ScoreError, ScoreResult};

/// The golden ratio, (1 + sqrt 5) / 2.
pub const PHI: f64 = 1.618_033_988_749_895;

/// Angle at which the reference density wave peaks.
pub const DENSITY_PEAK: f64 = 3.0 * PI / 4.0;

/// `a * e^(b * angle)`.
pub fn radius_at(a: f64, b: f64, angle: f64) -> ScoreResult<f64> {
    check_scale(a)?;
    check_growth(b)?;
    if !angle.is_finite() {
        return Err(ScoreError::config(format!("spiral angle must be finite, got {angle}")));
    }
    Ok(a * (b * angle).exp())
}

fn check_scale(a: f64) -> ScoreResult<()> {
    if !(a.is_finite() && a > 0.0) {
        return Err(ScoreError::config(format!(
            "spiral scale a must be finite and > 0, got {a}"
        )));
    }
    Ok(())
}

/// Validate a growth parameter `b`.
pub fn check_growth(b: f64) -> ScoreResult<()> {
    if b == 0.0 {
        return Err(ScoreError::config(
            "spiral growth b = 0 degenerates to a circle, not a spiral",
        ));
    }
    if !(b.is_finite() && b > 0.0) {
        return Err(ScoreError::config(format!(
            "spiral growth b must be finite and > 0, got {b}"
        )));
    }
    Ok(())
}

/// Shape of the density wave for one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityProfile {
    /// Number of spiral arms; the wave repeats `arms` times per turn.
    pub arms: u32,
    /// Angle (radians) of maximum density.
    pub peak: f64,
    /// Exponent applied to the raw bump. > 1 narrows the arms.
    pub sharpness: f64,
    /// Density between arms.
    pub floor: f64,
    /// Density on an arm crest.
    pub ceiling: f64,
}

impl Default for DensityProfile {
    fn default() -> Self {
        Self {
            arms: 2,
            peak: DENSITY_PEAK,
            sharpness: 1.0,
            floor: 0.0,
            ceiling: 1.0,
        }
    }
}

impl DensityProfile {
    pub fn validate(&self) -> ScoreResult<()> {
        if self.arms == 0 {
            return Err(ScoreError::config("density profile needs at least one arm"));
        }
        if !(self.sharpness.is_finite() && self.sharpness > 0.0) {
            return Err(ScoreError::config(format!(
                "density sharpness must be > 0, got {}",
                self.sharpness
            )));
        }
        if !self.peak.is_finite() {
            return Err(ScoreError::config("density peak angle must be finite"));
        }
        if !(0.0 <= self.floor && self.floor <= self.ceiling && self.ceiling <= 1.0) {
            return Err(ScoreError::config(format!(
                "density bounds must satisfy 0 <= floor <= ceiling <= 1, got [{}, {}]",
                self.floor, self.ceiling
            )));
        }
        Ok(())
    }
}

/// Density-wave intensity at `angle`, in `[floor, ceiling]` of the profile.
pub fn density_at(angle: f64, profile: &DensityProfile) -> f64 {
    let phase = f64::from(profile.arms) * (angle - profile.peak);
    let bump = ((1.0 + phase.cos()) / 2.0).clamp(0.0, 1.0);
    let shaped = bump.powf(profile.sharpness);
    (profile.floor + (profile.ceiling - profile.floor) * shaped).clamp(0.0, 1.0)
}

/// Whether golden scaling shrinks or stretches an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GoldenDirection {
    /// `offset / phi`
    #[default]
    Contract,
    /// `offset * phi`
    Expand,
}

/// A position on the spiral, sampled on demand and never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpiralPoint {
    pub angle: f64,
    pub radius: f64,
    pub density: f64,
}

/// Composer-supplied spiral constants. The growth `b` is per section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpiralModel {
    pub a: f64,
    pub direction: GoldenDirection,
}

impl Default for SpiralModel {
    fn default() -> Self {
        Self {
            a: 1.0,
            direction: GoldenDirection::Contract,
        }
    }
}

impl SpiralModel {
    pub fn new(a: f64, direction: GoldenDirection) -> ScoreResult<Self> {
        check_scale(a)?;
        Ok(Self { a, direction })
    }

    pub fn validate(&self) -> ScoreResult<()> {
        check_scale(self.a)
    }

    pub fn radius(&self, b: f64, angle: f64) -> ScoreResult<f64> {
        radius_at(self.a, b, angle)
    }

    pub fn point_at(
        &self,
        b: f64,
        angle: f64,
        profile: &DensityProfile,
    ) -> ScoreResult<SpiralPoint> {
        Ok(SpiralPoint {
            angle,
            radius: self.radius(b, angle)?,
            density: density_at(angle, profile),
        })
    }

    /// Where `point` sits between `radius(from)` and `radius(to)`, in [0, 1].
    /// Grows exponentially, so most of the rise happens late.
    pub fn normalized_radius(
        &self,
        b: f64,
        point: &SpiralPoint,
        from: f64,
        to: f64,
    ) -> ScoreResult<f64> {
        let r0 = self.radius(b, from)?;
        let r1 = self.radius(b, to)?;
        if r1 <= r0 {
            return Ok(0.0);
        }
        Ok(((point.radius - r0) / (r1 - r0)).clamp(0.0, 1.0))
    }

    pub fn golden_entry_offset(&self, base_offset: f64) -> f64 {
        match self.direction {
            GoldenDirection::Contract => base_offset / PHI,
            GoldenDirection::Expand => base_offset * PHI,
        }
    }
}
