//! # Tuner - command-line pitch tracker
//!
//! Captures from the default input device (or plays back a WAV file) and
//! prints the closest note and its cents deviation whenever the reading
//! changes. SIGINT/SIGTERM fire the detector's termination trigger; the loop
//! then stops the detector and exits.

use anyhow::{Context, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tuner_core::audio::{AudioSource, CpalSource, WavSource};
use tuner_core::detector::default_estimator_factory;
use tuner_core::{DetectionResult, PitchDetector, Status, TunerConfig};

/// Real-time monophonic pitch tracker
#[derive(Parser, Debug)]
#[command(name = "tuner", version, about, long_about = None)]
struct Args {
    /// JSON configuration file; missing keys fall back to defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RMS level at or below which a frame counts as silence
    #[arg(long)]
    noise_gate: Option<f32>,

    /// Reference frequency of A4 in Hz
    #[arg(long)]
    reference: Option<f32>,

    /// Samples per analysis frame
    #[arg(long)]
    frame_size: Option<usize>,

    /// Capture sample rate in Hz (ignored with --input)
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Refine the YIN estimate against the FFT spectrum
    #[arg(long)]
    refine: bool,

    /// Analyse a WAV file instead of the live input
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Restart the WAV file when it ends
    #[arg(long, requires = "input")]
    loop_input: bool,

    /// Input device name (defaults to the system default)
    #[arg(short, long, conflicts_with = "input")]
    device: Option<String>,

    /// How often the latest reading is polled, in milliseconds
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = match &args.config {
        Some(path) => TunerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TunerConfig::default(),
    };
    apply_overrides(&mut config, &args);

    let (source, finished): (Box<dyn AudioSource>, Option<Arc<AtomicBool>>) = match &args.input {
        Some(path) => {
            let wav = WavSource::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?
                .realtime(true)
                .looping(args.loop_input);
            log::info!(
                "Analysing {} ({} samples at {} Hz)",
                path.display(),
                wav.len(),
                wav.sample_rate()
            );
            config.sample_rate = wav.sample_rate();
            let finished = wav.finished_flag();
            (Box::new(wav), Some(finished))
        }
        None => {
            let cpal = match &args.device {
                Some(name) => CpalSource::with_device(name.clone()),
                None => CpalSource::new(),
            };
            (Box::new(cpal), None)
        }
    };

    let detector = PitchDetector::with_parts(config, source, default_estimator_factory())
        .context("Invalid configuration")?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(detector.config())?);
        return Ok(());
    }

    let trigger = detector.termination_trigger();
    ctrlc::set_handler(move || trigger.trigger()).context("Failed to install signal handler")?;

    let status = detector.start();
    println!("{status}");
    if let Status::Failed(reason) = status {
        bail!("{reason}");
    }

    let trigger = detector.termination_trigger();
    let interval = Duration::from_millis(args.interval_ms.max(1));
    let mut shown = DetectionResult::default();
    loop {
        let reading = detector.latest_result();
        if reading != shown {
            println!("{}", render_reading(&reading));
            shown = reading;
        }
        if trigger.is_triggered() {
            break;
        }
        if finished.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
            break;
        }
        thread::sleep(interval);
    }

    let status = detector.stop();
    let reading = detector.latest_result();
    if reading != shown {
        println!("{}", render_reading(&reading));
    }
    println!("{status}");

    let stats = detector.stats();
    log::debug!("Final statistics: {:?}", stats);
    Ok(())
}

fn apply_overrides(config: &mut TunerConfig, args: &Args) {
    if let Some(gate) = args.noise_gate {
        config.noise_gate_threshold = gate;
    }
    if let Some(reference) = args.reference {
        config.reference_a4 = reference;
    }
    if let Some(frame_size) = args.frame_size {
        config.frame_size = frame_size;
    }
    if let Some(sample_rate) = args.sample_rate {
        config.sample_rate = sample_rate;
    }
    if args.refine {
        config.spectral_refinement = true;
    }
}

const METER_HALF_WIDTH: i32 = 10;

/// One line per reading: note, frequency, deviation and a +-50 cent meter.
fn render_reading(reading: &DetectionResult) -> String {
    if reading.is_empty() {
        return "--".to_string();
    }
    let offset = (reading.cents / 50.0 * METER_HALF_WIDTH as f32)
        .round()
        .clamp(-METER_HALF_WIDTH as f32, METER_HALF_WIDTH as f32) as i32;
    let meter: String = (-METER_HALF_WIDTH..=METER_HALF_WIDTH)
        .map(|i| match i {
            _ if i == offset => '|',
            0 => '^',
            _ => '-',
        })
        .collect();
    format!(
        "{:<4} {:>8.2} Hz {:>+7.1} cents [{}]",
        reading.note, reading.pitch, reading.cents, meter
    )
}
