use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

use crate::analysis::FeatureVector;
use crate::classifier::facing::FacingDirection;
use crate::error::{PoseError, Result};

// --- データ構造 ---

/// 向きごとの基準特徴量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacingProfile {
    pub direction: FacingDirection,
    pub features: FeatureVector,
    /// 平均に使ったサンプル数（手書きの設定では省略可）
    #[serde(default)]
    pub samples: usize,
}

impl FacingProfile {
    pub fn new(direction: FacingDirection, features: FeatureVector) -> Self {
        Self {
            direction,
            features,
            samples: 1,
        }
    }
}

// --- 収集 ---

#[derive(Debug, Default)]
struct Accumulator {
    sums: Vec<f32>,
    counts: Vec<usize>,
    samples: usize,
}

/// 録画から取った特徴ベクトルを向きごとに平均してプロファイルを作る
///
/// 成分ごとに、値があったサンプルだけで平均する。
/// 一度も値が無かった成分は None のまま残る。
#[derive(Debug, Default)]
pub struct ProfileBuilder {
    len: Option<usize>,
    by_direction: BTreeMap<FacingDirection, Accumulator>,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, direction: FacingDirection, features: &FeatureVector) -> Result<()> {
        if direction == FacingDirection::Unknown {
            return Err(PoseError::config("cannot capture a profile for unknown direction"));
        }
        let len = *self.len.get_or_insert(features.len());
        if features.len() != len {
            return Err(PoseError::DimensionMismatch {
                expected: len,
                actual: features.len(),
            });
        }

        let acc = self.by_direction.entry(direction).or_default();
        if acc.sums.is_empty() {
            acc.sums = vec![0.0; len];
            acc.counts = vec![0; len];
        }
        for (i, value) in features.values().iter().enumerate() {
            if let Some(v) = value {
                acc.sums[i] += v;
                acc.counts[i] += 1;
            }
        }
        acc.samples += 1;
        Ok(())
    }

    pub fn samples(&self, direction: FacingDirection) -> usize {
        self.by_direction.get(&direction).map_or(0, |a| a.samples)
    }

    /// 向きの順（Front, Back, Left, Right）で返す
    pub fn build(&self) -> Vec<FacingProfile> {
        self.by_direction
            .iter()
            .map(|(&direction, acc)| {
                let values = acc
                    .sums
                    .iter()
                    .zip(&acc.counts)
                    .map(|(&sum, &n)| if n > 0 { Some(sum / n as f32) } else { None })
                    .collect();
                FacingProfile {
                    direction,
                    features: FeatureVector::new(values),
                    samples: acc.samples,
                }
            })
            .collect()
    }
}

// --- Save / Load ---

pub fn save_profiles(path: &str, profiles: &[FacingProfile]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(profiles)?;
    fs::write(path, json).context("Failed to write profile file")?;
    Ok(())
}

pub fn load_profiles(path: &str) -> anyhow::Result<Vec<FacingProfile>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile file: {}", path))?;
    let profiles: Vec<FacingProfile> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse profile file: {}", path))?;
    Ok(profiles)
}
