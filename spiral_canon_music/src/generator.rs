// Voice score generation: one voice, one section, a list of NoteEvents.
//
// Pipeline for `generate_section`:
// 1. Validate the section, role, subject, and canonic plan. Nothing is
//    produced if any of them is invalid (all-or-nothing).
// 2. Derive the voice's canonic line from the subject (canon.rs).
// 3. Tile the line across the section every `cycle` beats, starting at the
//    voice's entry. Notes starting at or after the section end are dropped;
//    notes that start inside may sustain past it.
// 4. For every note, sample a `SpiralPoint` at the note's angle:
//    - density -> velocity (`base * rel + round(density * range)`),
//    - density -> ornament subdivision (ornamental voices only),
//    - normalised radius -> registral lift in whole octaves.
// 5. Sort into canonical order, merge events sharing a `NoteKey` (keep the
//    longest), and for non-polyphonic voices truncate every note at the next
//    later attack.
//
// Subdivision policy for ornamental voices: at density >= SUBDIVIDE_HIGH a
// note becomes four equal parts on the figure [0, +7, +12, +7]; at density
// >= SUBDIVIDE_LOW it becomes two parts on [0, +12]. A split only happens if
// every part is at least MIN_ORNAMENT beats and the note ends inside the
// section. Parts are contiguous, so the covered duration never changes.

use log::debug;

use crate::canon::{CanonTransformer, Subject};
use crate::error::{ScoreError, ScoreResult};
use crate::event::{NoteEvent, tick_of};
use crate::section::SectionSpec;
use crate::spiral::{SpiralModel, SpiralPoint};
use crate::voice::{Texture, VoiceRole, VoiceSectionPlan, VoiceSpec};

/// Density at or above which ornaments split into four.
pub const SUBDIVIDE_HIGH: f64 = 0.66;
/// Density at or above which ornaments split into two.
pub const SUBDIVIDE_LOW: f64 = 0.33;
/// Shortest ornament part, in beats (a sixteenth).
pub const MIN_ORNAMENT: f64 = 0.25;
/// Upper bound on subject statements per section.
pub const MAX_STATEMENTS: usize = 4096;

const FIGURE_FOUR: [i32; 4] = [0, 7, 12, 7];
const FIGURE_TWO: [i32; 2] = [0, 12];

pub struct VoiceScoreGenerator<'m> {
    model: &'m SpiralModel,
    tonic: u8,
}

impl<'m> VoiceScoreGenerator<'m> {
    pub fn new(model: &'m SpiralModel, tonic: u8) -> Self {
        Self { model, tonic }
    }

    /// Generate every section for one voice. Fails as a whole if any
    /// section fails.
    pub fn generate_voice(
        &self,
        voice: &VoiceSpec,
        sections: &[SectionSpec],
    ) -> ScoreResult<Vec<Vec<NoteEvent>>> {
        voice.validate()?;
        sections
            .iter()
            .map(|section| {
                let plan = voice.plan_for(section.kind);
                self.generate_section(&voice.role, &voice.subject, &plan, section)
            })
            .collect()
    }

    /// Events for one voice in one section, with section-relative starts.
    pub fn generate_section(
        &self,
        role: &VoiceRole,
        subject: &Subject,
        plan: &VoiceSectionPlan,
        section: &SectionSpec,
    ) -> ScoreResult<Vec<NoteEvent>> {
        self.model.validate()?;
        section.validate()?;
        role.validate()?;
        subject.validate()?;
        let line = CanonTransformer::new(plan.canon.clone())?.derive(subject, role)?;

        let duration = section.duration;
        let mut events = Vec::new();
        let mut statement = 0usize;
        loop {
            let shift = statement as f64 * line.cycle;
            if line.origin + shift >= duration {
                break;
            }
            if statement >= MAX_STATEMENTS {
                return Err(ScoreError::config(format!(
                    "voice '{}': subject cycle {} is too short for a {duration}-beat {}",
                    role.name, line.cycle, section.kind
                )));
            }
            for note in &line.notes {
                let start = note.start + shift;
                if start < 0.0 || start >= duration {
                    continue;
                }
                let density = self.point_at(section, start)?.density;
                for (offset, length, figure) in
                    ornament_parts(role.texture, start, note.duration, density, duration)
                {
                    let at = start + offset;
                    let point = self.point_at(section, at)?;
                    let lift = self.lift_octaves(section, &point)?;
                    let pitch = fold_pitch(
                        i32::from(self.tonic)
                            + role.register_offset
                            + note.pitch
                            + figure
                            + 12 * lift,
                    );
                    events.push(NoteEvent {
                        voice: role.id,
                        pitch,
                        start: at,
                        duration: length,
                        velocity: velocity_for(role, note.velocity, point.density),
                        muted: plan.muted,
                    });
                }
            }
            statement += 1;
        }

        let events = normalize(events, role.texture);
        debug!(
            "{} {}: {} events from {} statements",
            role.name,
            section.kind,
            events.len(),
            statement
        );
        Ok(events)
    }

    fn point_at(&self, section: &SectionSpec, beat: f64) -> ScoreResult<SpiralPoint> {
        self.model
            .point_at(section.growth, section.angle_at(beat), &section.density)
    }

    fn lift_octaves(&self, section: &SectionSpec, point: &SpiralPoint) -> ScoreResult<i32> {
        if section.max_lift == 0 {
            return Ok(0);
        }
        let max = i32::from(section.max_lift);
        let r = self.model.normalized_radius(
            section.growth,
            point,
            section.start_angle,
            section.end_angle(),
        )?;
        Ok(((r * f64::from(max + 1)).floor() as i32).min(max))
    }
}

/// `(offset, length, figure)` parts a note is played as.
fn ornament_parts(
    texture: Texture,
    start: f64,
    length: f64,
    density: f64,
    section_end: f64,
) -> Vec<(f64, f64, i32)> {
    let whole = vec![(0.0, length, 0)];
    if texture != Texture::Ornamental || start + length > section_end {
        return whole;
    }
    let figure: &[i32] = if density >= SUBDIVIDE_HIGH && length / 4.0 >= MIN_ORNAMENT {
        &FIGURE_FOUR
    } else if density >= SUBDIVIDE_LOW && length / 2.0 >= MIN_ORNAMENT {
        &FIGURE_TWO
    } else {
        return whole;
    };
    let part = length / figure.len() as f64;
    figure
        .iter()
        .enumerate()
        .map(|(i, &step)| (i as f64 * part, part, step))
        .collect()
}

/// `base * rel + round(density * range)`, clamped to MIDI velocity.
pub fn velocity_for(role: &VoiceRole, relative: f64, density: f64) -> u8 {
    let base = (f64::from(role.base_velocity) * relative).round();
    let swell = (density * f64::from(role.velocity_range)).round();
    (base + swell).clamp(1.0, 127.0) as u8
}

/// Move a pitch by octaves into 0..=127.
pub fn fold_pitch(mut pitch: i32) -> u8 {
    while pitch < 0 {
        pitch += 12;
    }
    while pitch > 127 {
        pitch -= 12;
    }
    pitch as u8
}

/// Canonical order, one event per key, no overlaps for single-line voices.
fn normalize(mut events: Vec<NoteEvent>, texture: Texture) -> Vec<NoteEvent> {
    // Group by key first so near-equal starts of one pitch end up adjacent.
    events.sort_by(|a, b| {
        tick_of(a.start)
            .cmp(&tick_of(b.start))
            .then(a.pitch.cmp(&b.pitch))
            .then(a.duration.total_cmp(&b.duration))
            .then(a.start.total_cmp(&b.start))
    });

    // Same key: the longest sorts last, keep that one.
    let mut merged: Vec<NoteEvent> = Vec::with_capacity(events.len());
    for event in events {
        match merged.last_mut() {
            Some(prev) if prev.key() == event.key() => *prev = event,
            _ => merged.push(event),
        }
    }

    if !texture.is_polyphonic() {
        let ticks: Vec<i64> = merged.iter().map(|e| tick_of(e.start)).collect();
        let mut next = 0usize;
        for i in 0..merged.len() {
            next = next.max(i + 1);
            while next < merged.len() && ticks[next] <= ticks[i] {
                next += 1;
            }
            if next < merged.len() {
                let limit = merged[next].start - merged[i].start;
                if merged[i].duration > limit {
                    merged[i].duration = limit;
                }
            }
        }
    }
    merged
}
