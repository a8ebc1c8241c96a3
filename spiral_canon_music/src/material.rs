// Reference composition: three sections, six voices.
//
// The spiral walks outward across the piece. The Exposition covers half a turn
// on a loose arm with a thin density wave. The Development covers the next half
// turn with a steeper arm. The Culmination sweeps a further three quarters of
// a turn on the steepest arm, with the densest wave and a one-octave
// registral lift near the end.
//
// Voices enter at golden-ratio staggered offsets (`golden_entry_offset(4k)` for
// the k-th voice). Per-section plans carry the canonic devices: the lead
// augments in the Development, the arpeggio diminishes in the Culmination,
// and the bells stay silent through the Exposition, then answer inverted and
// finally in retrograde inversion.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::canon::{CanonOptions, Subject, SubjectNote};
use crate::event::VoiceId;
use crate::section::{SectionKind, SectionSpec};
use crate::spiral::{DENSITY_PEAK, DensityProfile, SpiralModel};
use crate::voice::{Texture, VoiceRole, VoiceSectionPlan, VoiceSpec};

pub const REFERENCE_TEMPO: f64 = 120.0;
/// Middle C.
pub const REFERENCE_TONIC: u8 = 60;
pub const REFERENCE_SECTION_BEATS: f64 = 32.0;

pub fn reference_sections() -> Vec<SectionSpec> {
    vec![
        SectionSpec {
            kind: SectionKind::Exposition,
            duration: REFERENCE_SECTION_BEATS,
            growth: 0.18,
            start_angle: 0.0,
            sweep: PI,
            density: DensityProfile {
                arms: 2,
                peak: DENSITY_PEAK,
                sharpness: 1.5,
                floor: 0.1,
                ceiling: 0.6,
            },
            max_lift: 0,
        },
        SectionSpec {
            kind: SectionKind::Development,
            duration: REFERENCE_SECTION_BEATS,
            growth: 0.3063,
            start_angle: PI,
            sweep: PI,
            density: DensityProfile {
                arms: 2,
                peak: DENSITY_PEAK,
                sharpness: 1.0,
                floor: 0.2,
                ceiling: 0.9,
            },
            max_lift: 0,
        },
        SectionSpec {
            kind: SectionKind::Culmination,
            duration: REFERENCE_SECTION_BEATS,
            growth: 0.45,
            start_angle: 2.0 * PI,
            sweep: 1.5 * PI,
            density: DensityProfile {
                arms: 2,
                peak: DENSITY_PEAK,
                sharpness: 0.8,
                floor: 0.35,
                ceiling: 1.0,
            },
            max_lift: 1,
        },
    ]
}

fn notes(spec: &[(i32, f64, f64, f64)]) -> Vec<SubjectNote> {
    spec.iter()
        .map(|&(pitch, start, duration, velocity)| {
            SubjectNote::new(pitch, start, duration, velocity)
        })
        .collect()
}

fn plans(entries: Vec<(SectionKind, VoiceSectionPlan)>) -> BTreeMap<SectionKind, VoiceSectionPlan> {
    entries.into_iter().collect()
}

fn role(
    index: u32,
    name: &str,
    model: &SpiralModel,
    register_offset: i32,
    texture: Texture,
    (base_velocity, velocity_range): (u8, u8),
) -> VoiceRole {
    VoiceRole {
        id: VoiceId(index),
        name: name.to_string(),
        register_offset,
        canonic_entry_offset: model.golden_entry_offset(4.0 * f64::from(index)),
        transposition_interval: 0,
        texture,
        base_velocity,
        velocity_range,
    }
}

pub fn reference_voices(model: &SpiralModel) -> Vec<VoiceSpec> {
    let bass = VoiceSpec {
        role: role(0, "Galactic Core", model, -24, Texture::Monophonic, (80, 30)),
        instrument: "Bass/Galactic Core Sub.adg".into(),
        midi_program: 38,
        subject: Subject::new(
            "core",
            notes(&[
                (0, 0.0, 2.0, 1.0),
                (7, 2.0, 1.0, 0.85),
                (5, 3.0, 1.0, 0.85),
                (0, 4.0, 2.0, 1.0),
                (-5, 6.0, 2.0, 0.9),
            ]),
            8.0,
        ),
        plans: BTreeMap::new(),
    };

    let pad = VoiceSpec {
        role: role(1, "Nebula Pad", model, -12, Texture::Polyphonic, (50, 30)),
        instrument: "Pads/Nebula Warm.adg".into(),
        midi_program: 89,
        subject: Subject::new(
            "nebula",
            notes(&[
                (0, 0.0, 8.0, 0.8),
                (4, 0.0, 8.0, 0.7),
                (7, 0.0, 8.0, 0.7),
                (5, 8.0, 8.0, 0.8),
                (9, 8.0, 8.0, 0.7),
                (12, 8.0, 8.0, 0.7),
            ]),
            16.0,
        ),
        plans: BTreeMap::new(),
    };

    let mut piano_role = role(2, "Spiral Piano", model, 0, Texture::Polyphonic, (70, 35));
    piano_role.transposition_interval = 7;
    let piano = VoiceSpec {
        role: piano_role,
        instrument: "Piano/Spiral Grand.adg".into(),
        midi_program: 0,
        subject: Subject::new(
            "spiral",
            notes(&[
                (0, 0.0, 1.0, 1.0),
                (4, 1.0, 1.0, 0.8),
                (7, 2.0, 1.0, 0.8),
                (12, 3.0, 1.0, 0.9),
                (7, 4.0, 1.0, 0.8),
                (4, 5.0, 1.0, 0.8),
                (2, 6.0, 2.0, 0.9),
                (-1, 6.0, 2.0, 0.7),
            ]),
            8.0,
        ),
        plans: BTreeMap::new(),
    };

    let lead = VoiceSpec {
        role: role(3, "Arm Lead", model, 12, Texture::Monophonic, (75, 40)),
        instrument: "Synth Lead/Arm Saw.adg".into(),
        midi_program: 81,
        subject: Subject::new(
            "arm",
            notes(&[
                (0, 0.0, 1.5, 1.0),
                (2, 1.5, 0.5, 0.8),
                (4, 2.0, 1.0, 0.9),
                (7, 3.0, 1.0, 0.9),
                (9, 4.0, 2.0, 1.0),
                (7, 6.0, 1.0, 0.85),
                (4, 7.0, 1.0, 0.85),
            ]),
            8.0,
        ),
        plans: plans(vec![(
            SectionKind::Development,
            VoiceSectionPlan {
                canon: CanonOptions {
                    rate: Some(2.0),
                    ..Default::default()
                },
                muted: false,
            },
        )]),
    };

    let arpeggio = VoiceSpec {
        role: role(4, "Stellar Arpeggio", model, 12, Texture::Ornamental, (60, 45)),
        instrument: "Mallets/Stellar Celesta.adg".into(),
        midi_program: 8,
        subject: Subject::new(
            "stellar",
            notes(&[
                (0, 0.0, 1.0, 1.0),
                (4, 1.0, 1.0, 0.85),
                (7, 2.0, 1.0, 0.85),
                (11, 3.0, 1.0, 0.9),
            ]),
            4.0,
        ),
        plans: plans(vec![(
            SectionKind::Culmination,
            VoiceSectionPlan {
                canon: CanonOptions {
                    rate: Some(0.5),
                    ..Default::default()
                },
                muted: false,
            },
        )]),
    };

    let bells = VoiceSpec {
        role: role(5, "Pulsar Bells", model, 24, Texture::Ornamental, (55, 40)),
        instrument: "Mallets/Pulsar Bells.adg".into(),
        midi_program: 14,
        subject: Subject::new(
            "pulsar",
            notes(&[(0, 0.0, 2.0, 1.0), (7, 2.0, 2.0, 0.9), (12, 4.0, 4.0, 0.8)]),
            8.0,
        ),
        plans: plans(vec![
            (
                SectionKind::Exposition,
                VoiceSectionPlan {
                    muted: true,
                    ..Default::default()
                },
            ),
            (
                SectionKind::Development,
                VoiceSectionPlan {
                    canon: CanonOptions {
                        inversion_axis: Some(6),
                        ..Default::default()
                    },
                    muted: false,
                },
            ),
            (
                SectionKind::Culmination,
                VoiceSectionPlan {
                    canon: CanonOptions {
                        inversion_axis: Some(6),
                        retrograde: true,
                        ..Default::default()
                    },
                    muted: false,
                },
            ),
        ]),
    };

    vec![bass, pad, piano, lead, arpeggio, bells]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tick_of;
    use crate::generator::VoiceScoreGenerator;
    use crate::section::validate_section_order;
    use crate::spiral::PHI;
    use crate::timeline::TimelineCompositor;
    use std::collections::BTreeSet;

    #[test]
    fn reference_material_is_valid() {
        let model = SpiralModel::default();
        let sections = reference_sections();
        validate_section_order(&sections).unwrap();
        for s in &sections {
            s.validate().unwrap();
        }
        let voices = reference_voices(&model);
        assert_eq!(voices.len(), 6);
        let ids: BTreeSet<_> = voices.iter().map(|v| v.role.id).collect();
        assert_eq!(ids.len(), 6);
        for v in &voices {
            v.validate().unwrap();
        }
    }

    #[test]
    fn entries_are_golden_staggered() {
        let model = SpiralModel::default();
        let voices = reference_voices(&model);
        assert_eq!(voices[0].role.canonic_entry_offset, 0.0);
        assert!((voices[1].role.canonic_entry_offset - 4.0 / PHI).abs() < 1e-12);
        assert!((voices[5].role.canonic_entry_offset - 20.0 / PHI).abs() < 1e-12);
    }

    #[test]
    fn reference_composition_composes_cleanly() {
        let model = SpiralModel::default();
        let sections = reference_sections();
        let generator = VoiceScoreGenerator::new(&model, REFERENCE_TONIC);
        let compositor = TimelineCompositor::from_sections(&sections).unwrap();
        assert_eq!(compositor.offsets(), vec![0.0, 32.0, 64.0]);

        for voice in reference_voices(&model) {
            let per_section = generator.generate_voice(&voice, &sections).unwrap();
            let slices: Vec<&[_]> = per_section.iter().map(Vec::as_slice).collect();
            let timeline = compositor.compose_voice(voice.role.id, &slices).unwrap();
            assert!(!timeline.is_empty(), "{} produced no events", voice.role.name);
            for window in timeline.events.windows(2) {
                assert!(
                    tick_of(window[0].start) <= tick_of(window[1].start),
                    "{} out of order",
                    voice.role.name
                );
            }
        }
    }

    #[test]
    fn bells_are_muted_only_in_the_exposition() {
        let model = SpiralModel::default();
        let sections = reference_sections();
        let bells = reference_voices(&model).pop().unwrap();
        let per_section = VoiceScoreGenerator::new(&model, REFERENCE_TONIC)
            .generate_voice(&bells, &sections)
            .unwrap();
        assert!(per_section[0].iter().all(|e| e.muted));
        assert!(per_section[1].iter().all(|e| !e.muted));
        assert!(per_section[2].iter().all(|e| !e.muted));
    }
}
