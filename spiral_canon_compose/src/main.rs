// Spiral Canon composer - CLI entry point.
//
// Generates the six-voice spiral canon (or any composition described by a
// JSON config) and sends it to a sequencer host. Without `--remote` the host
// is an in-memory simulated sequencer, optionally with injected transient
// failures, which makes the CLI a self-contained dispatch exercise.
//
// Usage:
//   cargo run -p spiral_canon_compose -- [--config FILE] [--dump-config]
//     [--batch-size N] [--failure-rate P] [--seed N] [--remote HOST:PORT]
//     [--timeout-ms N] [--midi FILE] [--no-play] [--no-dispatch]
//
// Exit status: 0 when every voice was generated and fully confirmed, 1 when
// the run finished with failures, 2 when it could not start.

use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use log::error;
use spiral_canon_compose::{ComposeError, ComposeResult, CompositionConfig, CompositionOrchestrator};
use spiral_canon_music::midi::write_midi;
use spiral_canon_sequencer::{
    CancelToken, RemoteSequencer, SequencerInterface, SimulatedConfig, SimulatedSequencer,
};

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().collect();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &[String]) -> ComposeResult<bool> {
    let mut config = match parse_flag::<String>(args, "--config")? {
        Some(path) => CompositionConfig::load(Path::new(&path))?,
        None => CompositionConfig::default(),
    };
    if let Some(n) = parse_flag(args, "--batch-size")? {
        config.dispatch.batch_size = n;
    }
    if let Some(seed) = parse_flag(args, "--seed")? {
        config.dispatch.seed = seed;
    }
    if has_flag(args, "--no-play") {
        config.fire_clips = false;
    }
    if has_flag(args, "--dump-config") {
        println!("{}", config.to_json_pretty()?);
        return Ok(true);
    }
    let failure_rate: f64 = parse_flag(args, "--failure-rate")?.unwrap_or(0.0);
    if !(0.0..1.0).contains(&failure_rate) {
        return Err(ComposeError::Usage(format!(
            "--failure-rate must be in [0, 1), got {failure_rate}"
        )));
    }

    println!("=== Spiral Canon ===");
    println!("[1/5] Validating configuration...");
    let orchestrator = CompositionOrchestrator::new(config)?;
    let config = orchestrator.config();
    println!(
        "  '{}': {} voices, {} sections, {} BPM, tonic {}",
        config.title,
        config.voices.len(),
        config.sections.len(),
        config.tempo,
        config.tonic
    );

    println!("[2/5] Generating voices...");
    let score = orchestrator.generate()?;
    println!(
        "  {} events over {} beats.",
        score.total_events(),
        score.total_length
    );
    for failed in score.failed_voices() {
        println!(
            "  {} failed: {}",
            failed.report.name,
            failed.report.generation_error.as_deref().unwrap_or("unknown error")
        );
    }

    match parse_flag::<String>(args, "--midi")? {
        Some(path) => {
            println!("[3/5] Writing MIDI to {path}...");
            let parts = orchestrator.midi_parts(&score);
            write_midi(&parts, config.tempo, Path::new(&path)).map_err(|source| {
                ComposeError::Write {
                    path: path.clone().into(),
                    source,
                }
            })?;
            println!("  {} tracks written.", parts.len());
        }
        None => println!("[3/5] No MIDI output requested."),
    }

    if has_flag(args, "--no-dispatch") {
        println!("[4/5] Dispatch skipped.");
        println!("[5/5] Summary");
        let report = orchestrator.summarize(&score);
        println!("{report}");
        return Ok(report.is_complete());
    }

    let host: Box<dyn SequencerInterface> = match parse_flag::<String>(args, "--remote")? {
        Some(addr) => {
            let timeout = Duration::from_millis(parse_flag(args, "--timeout-ms")?.unwrap_or(5000));
            println!("[4/5] Connecting to sequencer host at {addr}...");
            let remote = RemoteSequencer::connect(addr.as_str(), timeout)?;
            println!(
                "  Connected ({} inserts).",
                if remote.idempotent_inserts() { "idempotent" } else { "non-idempotent" }
            );
            Box::new(remote)
        }
        None => {
            println!("[4/5] Using simulated sequencer (failure rate {failure_rate})...");
            Box::new(SimulatedSequencer::new(SimulatedConfig {
                transient_failure_rate: failure_rate,
                seed: config.dispatch.seed,
                ..SimulatedConfig::default()
            }))
        }
    };

    println!(
        "[5/5] Dispatching in batches of {}...",
        config.dispatch.batch_size
    );
    let report = orchestrator.dispatch(host.as_ref(), &score, &CancelToken::new())?;
    println!();
    println!("{report}");
    Ok(report.is_complete())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_flag<T: FromStr>(args: &[String], flag: &str) -> ComposeResult<Option<T>> {
    let Some(i) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    let value = args
        .get(i + 1)
        .ok_or_else(|| ComposeError::Usage(format!("{flag} needs a value")))?;
    value
        .parse()
        .map(Some)
        .map_err(|_| ComposeError::Usage(format!("{flag}: cannot parse '{value}'")))
}
