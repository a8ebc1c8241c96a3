// What a composition run did, per voice and in total.
//
// Generation and dispatch failures are recorded here rather than returned as
// errors: one voice failing never hides what happened to the others. A
// voice's report carries its generated counts (per section and in total),
// the generation error if it produced nothing, and the `DispatchReport` if it
// reached the host. `CompositionReport` implements `Display` for the CLI and
// `Serialize` for machine-readable output.

use std::fmt;

use serde::Serialize;
use spiral_canon_music::{SectionKind, VoiceId};
use spiral_canon_sequencer::DispatchReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceReport {
    pub voice: VoiceId,
    pub name: String,
    pub generated_events: usize,
    pub muted_events: usize,
    /// Events generated in each section, in form order.
    pub per_section: Vec<(SectionKind, usize)>,
    /// Set when generation or composition failed; nothing was dispatched.
    pub generation_error: Option<String>,
    pub dispatch: Option<DispatchReport>,
    pub fired: bool,
    /// Set when the clip could not be launched.
    pub playback_error: Option<String>,
}

impl VoiceReport {
    pub fn new(voice: VoiceId, name: impl Into<String>) -> Self {
        Self {
            voice,
            name: name.into(),
            generated_events: 0,
            muted_events: 0,
            per_section: Vec::new(),
            generation_error: None,
            dispatch: None,
            fired: false,
            playback_error: None,
        }
    }

    pub fn confirmed_events(&self) -> usize {
        self.dispatch.as_ref().map_or(0, |d| d.confirmed_events)
    }

    /// Generated cleanly and, if dispatched, every event is confirmed.
    pub fn is_complete(&self) -> bool {
        self.generation_error.is_none()
            && self.playback_error.is_none()
            && self.dispatch.as_ref().is_none_or(DispatchReport::is_complete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositionReport {
    pub title: String,
    pub tempo: f64,
    pub total_beats: f64,
    pub voices: Vec<VoiceReport>,
    /// Set when the tempo could not be applied on the host.
    pub tempo_error: Option<String>,
    /// Whether a host was involved at all.
    pub dispatched: bool,
}

impl CompositionReport {
    pub fn total_generated(&self) -> usize {
        self.voices.iter().map(|v| v.generated_events).sum()
    }

    pub fn total_confirmed(&self) -> usize {
        self.voices.iter().map(VoiceReport::confirmed_events).sum()
    }

    pub fn total_retries(&self) -> u32 {
        self.voices
            .iter()
            .filter_map(|v| v.dispatch.as_ref())
            .map(|d| d.retries)
            .sum()
    }

    pub fn voice(&self, voice: VoiceId) -> Option<&VoiceReport> {
        self.voices.iter().find(|v| v.voice == voice)
    }

    pub fn is_complete(&self) -> bool {
        self.tempo_error.is_none() && self.voices.iter().all(VoiceReport::is_complete)
    }
}

impl fmt::Display for CompositionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} voices, {} beats at {} BPM",
            self.title,
            self.voices.len(),
            self.total_beats,
            self.tempo
        )?;
        if let Some(e) = &self.tempo_error {
            writeln!(f, "  tempo not set: {e}")?;
        }
        for v in &self.voices {
            let sections: Vec<String> = v
                .per_section
                .iter()
                .map(|(kind, n)| format!("{kind} {n}"))
                .collect();
            write!(
                f,
                "  {:<18} {:>5} events ({})",
                v.name,
                v.generated_events,
                sections.join(", ")
            )?;
            if v.muted_events > 0 {
                write!(f, ", {} muted", v.muted_events)?;
            }
            writeln!(f)?;
            if let Some(e) = &v.generation_error {
                writeln!(f, "      generation failed: {e}")?;
                continue;
            }
            let Some(d) = &v.dispatch else { continue };
            write!(
                f,
                "      dispatched {}/{} in {} batches, {} attempts, {} retries",
                d.confirmed_events,
                d.total_events,
                d.sent_batches.len(),
                d.attempts,
                d.retries
            )?;
            if d.skipped_events > 0 {
                write!(f, ", {} already present", d.skipped_events)?;
            }
            if v.fired {
                write!(f, ", playing")?;
            }
            writeln!(f)?;
            if !d.failed_batches.is_empty() {
                let failed: Vec<String> =
                    d.failed_batches.iter().map(ToString::to_string).collect();
                writeln!(f, "      failed batches: {}", failed.join(" "))?;
            }
            if !d.unsent_batches.is_empty() {
                writeln!(f, "      unsent batches: {}", d.unsent_batches.len())?;
            }
            if let Some(reason) = &d.aborted {
                writeln!(f, "      aborted: {reason}")?;
            }
            if d.cancelled {
                writeln!(f, "      cancelled")?;
            }
            if let Some(e) = &v.playback_error {
                writeln!(f, "      clip not launched: {e}")?;
            }
        }
        write!(f, "Total: {} events generated", self.total_generated())?;
        if self.dispatched {
            write!(
                f,
                ", {} confirmed, {} retries",
                self.total_confirmed(),
                self.total_retries()
            )?;
        }
        Ok(())
    }
}
