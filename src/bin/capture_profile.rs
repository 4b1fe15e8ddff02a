use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use talava_form::analysis::FeatureExtractor;
use talava_form::classifier::{load_profiles, save_profiles, FacingDirection, ProfileBuilder};
use talava_form::config::Config;
use talava_form::frame::read_valid_frames;
use talava_form::pose::normalize;

const CONFIG_PATH: &str = "config.toml";

fn parse_direction(name: &str) -> Result<FacingDirection> {
    Ok(match name {
        "front" => FacingDirection::Front,
        "back" => FacingDirection::Back,
        "left" => FacingDirection::Left,
        "right" => FacingDirection::Right,
        _ => bail!("unknown direction '{}' (front / back / left / right)", name),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(
            std::env::var("POSE_LOG")
                .ok()
                .and_then(|v| v.parse::<tracing_subscriber::filter::LevelFilter>().ok())
                .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    // Usage: capture_profile <direction> <poses.jsonl> <profiles.json> [config.toml]
    // e.g.  capture_profile front front.jsonl profiles.json
    if args.len() < 4 {
        bail!("usage: capture_profile <front|back|left|right> <poses.jsonl> <profiles.json> [config.toml]");
    }
    let direction = parse_direction(&args[1])?;
    let input = &args[2];
    let output = &args[3];
    let config = Config::load_or_default(args.get(4).map(String::as_str).unwrap_or(CONFIG_PATH));

    println!("=== Facing Profile Capture ({}) ===", env!("GIT_VERSION"));
    println!("  向き: {:?}", direction);
    println!("  入力: {}", input);
    println!("  出力: {}", output);

    let extractor = FeatureExtractor::new(&config.features)?;
    let mut builder = ProfileBuilder::new();
    let mut skipped = 0usize;

    let reader = BufReader::new(File::open(input).with_context(|| format!("Failed to open {}", input))?);
    for frame in read_valid_frames(reader) {
        let frame = frame?;
        let features = normalize(&frame.pose, &config.normalize).and_then(|np| extractor.features(&np));
        match features {
            Ok(f) => builder.add(direction, &f)?,
            Err(e) => {
                tracing::debug!(id = frame.id, error = %e, "frame skipped");
                skipped += 1;
            }
        }
    }

    let captured = builder.samples(direction);
    if captured == 0 {
        bail!("no usable frames in {} ({} skipped)", input, skipped);
    }
    println!("  使用フレーム: {} (スキップ: {})", captured, skipped);

    // 既存ファイルの同じ向きは置き換え、他の向きは残す
    let mut profiles = if Path::new(output).exists() {
        load_profiles(output)?
    } else {
        Vec::new()
    };
    profiles.retain(|p| p.direction != direction);
    profiles.extend(builder.build());
    profiles.sort_by_key(|p| p.direction);

    for p in &profiles {
        if p.features.len() != extractor.len() {
            tracing::warn!(
                direction = ?p.direction,
                len = p.features.len(),
                expected = extractor.len(),
                "profile length differs from current feature layout"
            );
        }
    }

    save_profiles(output, &profiles)?;
    println!("保存しました: {} ({} 向き)", output, profiles.len());
    Ok(())
}
