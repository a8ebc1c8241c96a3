// Sections of the piece and their spiral parameters.
//
// The form is fixed: Exposition, Development, Culmination, in that order.
// Each section walks its own stretch of the spiral (`start_angle` plus
// `sweep` radians) with its own growth `b` and density profile. Section
// lengths are explicit configuration; the compositor turns them into
// cumulative offsets, so no call site hardcodes 32 or 64.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ScoreError, ScoreResult};
use crate::spiral::{DensityProfile, check_growth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionKind {
    Exposition,
    Development,
    Culmination,
}

impl SectionKind {
    pub const ALL: [SectionKind; 3] = [
        SectionKind::Exposition,
        SectionKind::Development,
        SectionKind::Culmination,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SectionKind::Exposition => "Exposition",
            SectionKind::Development => "Development",
            SectionKind::Culmination => "Culmination",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    pub kind: SectionKind,
    /// Length in beats.
    pub duration: f64,
    /// Spiral growth `b` for this section.
    pub growth: f64,
    /// Spiral angle at the first beat (radians).
    pub start_angle: f64,
    /// Radians covered over the whole section.
    pub sweep: f64,
    pub density: DensityProfile,
    /// Octaves the outer arm may lift a voice by the section's end.
    #[serde(default)]
    pub max_lift: u8,
}

impl SectionSpec {
    pub fn validate(&self) -> ScoreResult<()> {
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(ScoreError::config(format!(
                "{} duration must be > 0 beats, got {}",
                self.kind, self.duration
            )));
        }
        check_growth(self.growth)
            .map_err(|e| ScoreError::config(format!("{}: {e}", self.kind)))?;
        if !self.start_angle.is_finite() {
            return Err(ScoreError::config(format!("{} start angle must be finite", self.kind)));
        }
        if !(self.sweep.is_finite() && self.sweep > 0.0) {
            return Err(ScoreError::config(format!(
                "{} sweep must be > 0 radians, got {}",
                self.kind, self.sweep
            )));
        }
        if self.max_lift > 3 {
            return Err(ScoreError::config(format!(
                "{} max lift must be at most 3 octaves, got {}",
                self.kind, self.max_lift
            )));
        }
        self.density
            .validate()
            .map_err(|e| ScoreError::config(format!("{}: {e}", self.kind)))
    }

    /// Spiral angle at `beat` beats into the section.
    pub fn angle_at(&self, beat: f64) -> f64 {
        self.start_angle + self.sweep * beat / self.duration
    }

    pub fn end_angle(&self) -> f64 {
        self.start_angle + self.sweep
    }
}

/// Check that sections follow the fixed form order, each kind at most once.
pub fn validate_section_order(sections: &[SectionSpec]) -> ScoreResult<()> {
    if sections.is_empty() {
        return Err(ScoreError::config("a composition needs at least one section"));
    }
    for pair in sections.windows(2) {
        if pair[0].kind >= pair[1].kind {
            return Err(ScoreError::config(format!(
                "sections must follow Exposition, Development, Culmination order; \
                 found {} before {}",
                pair[0].kind, pair[1].kind
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn spec(kind: SectionKind) -> SectionSpec {
        SectionSpec {
            kind,
            duration: 32.0,
            growth: 0.3,
            start_angle: PI,
            sweep: PI,
            density: DensityProfile::default(),
            max_lift: 0,
        }
    }

    #[test]
    fn angle_runs_from_start_to_end() {
        let s = spec(SectionKind::Development);
        assert_eq!(s.angle_at(0.0), PI);
        assert!((s.angle_at(16.0) - 1.5 * PI).abs() < 1e-12);
        assert!((s.angle_at(32.0) - s.end_angle()).abs() < 1e-12);
    }

    #[test]
    fn non_positive_duration_is_a_configuration_error() {
        let mut s = spec(SectionKind::Exposition);
        s.duration = 0.0;
        assert!(matches!(s.validate(), Err(ScoreError::Configuration(_))));
        s.duration = -8.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn zero_growth_is_rejected() {
        let mut s = spec(SectionKind::Exposition);
        s.growth = 0.0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("circle"), "{err}");
    }

    #[test]
    fn section_order_is_enforced() {
        let ok = vec![spec(SectionKind::Exposition), spec(SectionKind::Culmination)];
        assert!(validate_section_order(&ok).is_ok());
        let swapped = vec![spec(SectionKind::Development), spec(SectionKind::Exposition)];
        assert!(validate_section_order(&swapped).is_err());
        let repeated = vec![spec(SectionKind::Exposition), spec(SectionKind::Exposition)];
        assert!(validate_section_order(&repeated).is_err());
        assert!(validate_section_order(&[]).is_err());
    }
}
