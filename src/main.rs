use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use talava_form::config::Config;
use talava_form::frame::{read_valid_frames, Frame, FrameSlot};
use talava_form::session::{FrameOutcome, Session};

const CONFIG_PATH: &str = "config.toml";

struct Args {
    input: Option<String>,
    config: String,
    /// 読み込みスレッドと処理を分け、最新フレームだけを処理する
    latest_only: bool,
}

fn parse_args() -> Args {
    // Usage: pose-replay [--latest] [poses.jsonl] [config.toml]
    let mut args = Args {
        input: None,
        config: CONFIG_PATH.to_string(),
        latest_only: false,
    };
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--latest" {
            args.latest_only = true;
        } else {
            positional.push(arg);
        }
    }
    let mut positional = positional.into_iter();
    args.input = positional.next().filter(|p| p != "-");
    if let Some(config) = positional.next() {
        args.config = config;
    }
    args
}

fn init_logging() {
    let level = std::env::var("POSE_LOG")
        .ok()
        .and_then(|v| v.parse::<tracing_subscriber::filter::LevelFilter>().ok())
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn open_input(path: &Option<String>) -> Result<Box<dyn BufRead + Send>> {
    Ok(match path {
        Some(p) => Box::new(BufReader::new(
            File::open(p).with_context(|| format!("Failed to open {}", p))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    })
}

fn emit(out: &mut impl Write, outcome: FrameOutcome) -> Result<()> {
    match outcome {
        FrameOutcome::Report(report) => {
            serde_json::to_writer(&mut *out, &report)?;
            writeln!(out)?;
        }
        FrameOutcome::Dropped { id, last_id } => {
            tracing::debug!(id, last_id, "dropped");
        }
    }
    Ok(())
}

/// 全フレームを順に処理。不正な行は飛ばし、読み込みエラーでだけ止まる
fn replay_all(session: &mut Session, input: Box<dyn BufRead + Send>, out: &mut impl Write) -> Result<u64> {
    let mut processed = 0;
    for frame in read_valid_frames(input) {
        let frame = frame?;
        emit(out, session.process(&frame))?;
        processed += 1;
    }
    Ok(processed)
}

fn publish_all(input: Box<dyn BufRead + Send>, slot: &FrameSlot) -> Result<()> {
    for frame in read_valid_frames(input) {
        let frame: Frame = frame?;
        slot.publish(frame);
    }
    Ok(())
}

/// 読み込みスレッドが FrameSlot に上書きし、処理側は最新だけを拾う
fn replay_latest(session: &mut Session, input: Box<dyn BufRead + Send>, out: &mut impl Write) -> Result<u64> {
    let slot = FrameSlot::new();
    let writer = slot.clone();
    let done = Arc::new(AtomicBool::new(false));
    let done_ref = done.clone();

    let handle = thread::spawn(move || -> Result<()> {
        let result = publish_all(input, &writer);
        done_ref.store(true, Ordering::Release);
        result
    });

    let mut processed = 0;
    loop {
        let finished = done.load(Ordering::Acquire);
        match slot.take_newer(session.last_id()) {
            Some(frame) => {
                emit(out, session.process(&frame))?;
                processed += 1;
            }
            None if finished => break,
            None => thread::sleep(Duration::from_millis(1)),
        }
    }

    match handle.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("reader thread panicked"),
    }
    Ok(processed)
}

fn main() -> Result<()> {
    init_logging();
    let args = parse_args();

    tracing::info!(version = env!("GIT_VERSION"), "pose-replay");
    let config = Config::load_or_default(&args.config);
    let mut session = Session::open(&config)?;
    let input = open_input(&args.input)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let processed = if args.latest_only {
        replay_latest(&mut session, input, &mut out)?
    } else {
        replay_all(&mut session, input, &mut out)?
    };
    out.flush()?;

    tracing::info!(
        frames = processed,
        reps = session.reps(),
        phase = ?session.phase(),
        "replay finished"
    );
    Ok(())
}
