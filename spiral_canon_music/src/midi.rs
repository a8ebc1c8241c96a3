// MIDI export of composed timelines.
//
// Writes a Standard MIDI File (format 1): track 0 carries the tempo, then one
// named track per voice with its program change. Beats map to ticks at
// TICKS_PER_QUARTER. Muted events are left out, since a file has no notion of
// a muted-but-present note.
//
// Same-pitch overlaps (pad tails ringing into a re-attack) are cut at the
// re-attack so every NoteOn has exactly one matching NoteOff.
//
// Uses the `midly` crate for MIDI writing.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};

use crate::event::NoteEvent;
use crate::timeline::Timeline;

/// Ticks per quarter note in MIDI output.
pub const TICKS_PER_QUARTER: u16 = 480;

/// Channel 10 is reserved for percussion in General MIDI.
const DRUM_CHANNEL: u8 = 9;

/// One voice as it appears in the file.
pub struct MidiPart<'a> {
    pub name: &'a str,
    pub program: u8,
    pub timeline: &'a Timeline,
}

/// Convert parts to MIDI and write to a file.
pub fn write_midi(parts: &[MidiPart<'_>], tempo_bpm: f64, path: &Path) -> io::Result<()> {
    let bytes = midi_bytes(parts, tempo_bpm)?;
    std::fs::write(path, bytes)
}

/// Encode parts as SMF bytes.
pub fn midi_bytes(parts: &[MidiPart<'_>], tempo_bpm: f64) -> io::Result<Vec<u8>> {
    let smf = timelines_to_smf(parts, tempo_bpm);
    let mut buf = Vec::new();
    smf.write_std(&mut buf)?;
    Ok(buf)
}

fn beat_to_tick(beats: f64) -> u32 {
    (beats * f64::from(TICKS_PER_QUARTER)).round().max(0.0) as u32
}

fn channel_for(index: usize) -> u4 {
    // Skip the drum channel so melodic programs stay melodic.
    let mut channel = (index % 15) as u8;
    if channel >= DRUM_CHANNEL {
        channel += 1;
    }
    u4::new(channel)
}

/// Convert parts to an in-memory SMF.
pub fn timelines_to_smf<'a>(parts: &[MidiPart<'a>], tempo_bpm: f64) -> Smf<'a> {
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));

    // Track 0: tempo track
    let tempo_microseconds = (60_000_000.0 / tempo_bpm.max(1.0)).round() as u32;
    let tempo_track: Track<'a> = vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(tempo_microseconds))),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        },
    ];
    smf.tracks.push(tempo_track);

    for (index, part) in parts.iter().enumerate() {
        let channel = channel_for(index);
        let mut track: Track<'a> = vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::TrackName(part.name.as_bytes())),
            },
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel,
                    message: MidiMessage::ProgramChange {
                        program: u7::new(part.program.min(127)),
                    },
                },
            },
        ];

        let mut last_tick = 0u32;
        for (tick, message) in note_messages(&part.timeline.events) {
            track.push(TrackEvent {
                delta: u28::new(tick - last_tick),
                kind: TrackEventKind::Midi { channel, message },
            });
            last_tick = tick;
        }

        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        smf.tracks.push(track);
    }

    smf
}

/// Absolute-tick NoteOn/NoteOff messages in playback order.
fn note_messages(events: &[NoteEvent]) -> Vec<(u32, MidiMessage)> {
    // (on, off, pitch, velocity), sorted by attack.
    let mut notes: Vec<(u32, u32, u8, u8)> = events
        .iter()
        .filter(|e| !e.muted)
        .map(|e| (beat_to_tick(e.start), beat_to_tick(e.end()), e.pitch, e.velocity))
        .collect();
    notes.sort_by_key(|&(on, _, pitch, _)| (on, pitch));

    let mut sounding: BTreeMap<u8, usize> = BTreeMap::new();
    for i in 0..notes.len() {
        let (on, _, pitch, _) = notes[i];
        if let Some(prev) = sounding.insert(pitch, i) {
            if notes[prev].1 > on {
                notes[prev].1 = on;
            }
        }
    }

    // Offs sort before ons at the same tick.
    let mut messages: Vec<(u32, bool, MidiMessage)> = Vec::with_capacity(notes.len() * 2);
    for (on, off, pitch, velocity) in notes {
        if off <= on {
            continue;
        }
        let key = u7::new(pitch.min(127));
        messages.push((
            on,
            true,
            MidiMessage::NoteOn {
                key,
                vel: u7::new(velocity.clamp(1, 127)),
            },
        ));
        messages.push((off, false, MidiMessage::NoteOff { key, vel: u7::new(0) }));
    }
    messages.sort_by_key(|&(tick, is_on, _)| (tick, is_on));
    messages.into_iter().map(|(tick, _, m)| (tick, m)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::VoiceId;

    fn note(start: f64, duration: f64, pitch: u8, muted: bool) -> NoteEvent {
        NoteEvent {
            voice: VoiceId(0),
            pitch,
            start,
            duration,
            velocity: 90,
            muted,
        }
    }

    fn timeline(events: Vec<NoteEvent>) -> Timeline {
        let n = events.len();
        Timeline {
            voice: VoiceId(0),
            events,
            sections: vec![0..n],
            length: 8.0,
        }
    }

    #[test]
    fn one_track_per_part_plus_tempo() {
        let a = timeline(vec![note(0.0, 1.0, 60, false)]);
        let b = timeline(vec![note(1.0, 1.0, 64, false)]);
        let parts = [
            MidiPart { name: "bass", program: 38, timeline: &a },
            MidiPart { name: "pad", program: 89, timeline: &b },
        ];
        let smf = timelines_to_smf(&parts, 120.0);
        assert_eq!(smf.tracks.len(), 3);
        assert_eq!(smf.header.format, Format::Parallel);
    }

    #[test]
    fn muted_notes_are_omitted() {
        let t = timeline(vec![note(0.0, 1.0, 60, false), note(1.0, 1.0, 62, true)]);
        let messages = note_messages(&t.events);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn same_pitch_overlap_is_cut_at_reattack() {
        let t = timeline(vec![note(0.0, 4.0, 60, false), note(2.0, 1.0, 60, false)]);
        let messages = note_messages(&t.events);
        let ticks: Vec<u32> = messages.iter().map(|(tick, _)| *tick).collect();
        assert_eq!(ticks, vec![0, 960, 960, 1440]);
        assert!(matches!(messages[1].1, MidiMessage::NoteOff { .. }));
        assert!(matches!(messages[2].1, MidiMessage::NoteOn { .. }));
    }

    #[test]
    fn written_bytes_parse_back() {
        let t = timeline(vec![note(0.0, 1.0, 60, false), note(0.5, 2.0, 67, false)]);
        let parts = [MidiPart { name: "piano", program: 0, timeline: &t }];
        let bytes = midi_bytes(&parts, 96.0).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 2);
        let ons = smf.tracks[1]
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    TrackEventKind::Midi {
                        message: MidiMessage::NoteOn { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(ons, 2);
    }

    #[test]
    fn drum_channel_is_skipped() {
        assert_eq!(channel_for(8).as_int(), 8);
        assert_eq!(channel_for(9).as_int(), 10);
        assert_eq!(channel_for(14).as_int(), 15);
    }
}
