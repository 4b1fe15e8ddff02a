use serde::Serialize;

use crate::config::{KneeSelection, SquatConfig};
use crate::error::{PoseError, Result};
use crate::pose::{AngleSet, JointAngle};

/// スクワットの局面
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SquatPhase {
    /// 初期状態、または入力欠損からの復帰待ち
    Unknown,
    Standing,
    Descending,
    Bottom,
    Ascending,
}

/// 1フレーム分の入力（度）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KneeReading {
    pub knee: f32,
    /// 股関節角（取得できた場合）
    pub hip: Option<f32>,
}

/// update の結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SquatUpdate {
    pub phase: SquatPhase,
    pub reps: u32,
    /// このフレームで1回分が完了した
    pub rep_completed: bool,
    /// 局面が変わった場合の遷移元
    pub previous: Option<SquatPhase>,
    /// 判定に使った膝角度（欠損時None）
    pub knee_angle: Option<f32>,
}

/// 膝角度の状態機械でスクワットの局面と回数を数える
///
/// Standing → Descending → Bottom → Ascending → Standing を1回とする。
/// 戻り方向の閾値には hysteresis を足して境界でのばたつきを防ぐ。
#[derive(Debug, Clone)]
pub struct SquatClassifier {
    config: SquatConfig,
    phase: SquatPhase,
    reps: u32,
    /// 入力された総フレーム数
    frames: u64,
    /// 現在の局面に入ってからのフレーム数
    frames_in_phase: u64,
    /// bottom_threshold を下回り続けているフレーム数
    bottom_streak: u32,
    /// 連続欠損フレーム数
    missing_streak: u32,
}

impl SquatClassifier {
    pub fn new(config: SquatConfig) -> Result<Self> {
        validate(&config)?;
        Ok(Self {
            config,
            phase: SquatPhase::Unknown,
            reps: 0,
            frames: 0,
            frames_in_phase: 0,
            bottom_streak: 0,
            missing_streak: 0,
        })
    }

    pub fn from_config(config: &SquatConfig) -> Result<Self> {
        Self::new(config.clone())
    }

    pub fn phase(&self) -> SquatPhase {
        self.phase
    }

    pub fn reps(&self) -> u32 {
        self.reps
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn frames_in_phase(&self) -> u64 {
        self.frames_in_phase
    }

    /// 関節角セットから膝角度を選んで更新
    pub fn update(&mut self, angles: &AngleSet) -> SquatUpdate {
        let reading = self.select(angles);
        self.update_angle(reading)
    }

    /// 欠損フレームは None を渡す
    pub fn update_angle(&mut self, reading: Option<KneeReading>) -> SquatUpdate {
        self.frames += 1;
        let before = self.phase;
        let mut rep_completed = false;

        match reading {
            None => {
                self.missing_streak = self.missing_streak.saturating_add(1);
                if self.missing_streak > self.config.max_missing_frames && self.phase != SquatPhase::Unknown {
                    tracing::debug!(
                        missing = self.missing_streak,
                        from = ?self.phase,
                        "squat input lost"
                    );
                    self.bottom_streak = 0;
                    self.phase = SquatPhase::Unknown;
                }
            }
            Some(r) => {
                self.missing_streak = 0;
                rep_completed = self.step(r);
            }
        }

        let previous = if self.phase != before {
            tracing::debug!(from = ?before, to = ?self.phase, "squat phase");
            self.frames_in_phase = 0;
            Some(before)
        } else {
            self.frames_in_phase += 1;
            None
        };
        if rep_completed {
            tracing::info!(reps = self.reps, "squat rep completed");
        }

        SquatUpdate {
            phase: self.phase,
            reps: self.reps,
            rep_completed,
            previous,
            knee_angle: reading.map(|r| r.knee),
        }
    }

    /// 局面と回数を初期化（同一セッション内で新しいセットを始めるとき）
    pub fn reset(&mut self) {
        self.phase = SquatPhase::Unknown;
        self.reps = 0;
        self.frames = 0;
        self.frames_in_phase = 0;
        self.bottom_streak = 0;
        self.missing_streak = 0;
    }

    /// 有効な角度での遷移。回数が増えたら true
    fn step(&mut self, r: KneeReading) -> bool {
        let c = &self.config;
        let stand_above = c.down_threshold + c.hysteresis;
        let rise_above = c.bottom_threshold + c.hysteresis;
        let angle = r.knee;

        match self.phase {
            SquatPhase::Unknown => {
                // 立位を確認してから数え始める
                if angle > stand_above {
                    self.phase = SquatPhase::Standing;
                }
            }
            SquatPhase::Standing => {
                if angle < c.down_threshold {
                    self.phase = SquatPhase::Descending;
                    self.bottom_streak = 0;
                    // 1フレームで一気に沈んだ場合もここから数える
                    self.track_bottom(r);
                }
            }
            SquatPhase::Descending => {
                if angle > stand_above {
                    // 底まで届かなかった: 数えずに立位へ戻る
                    self.phase = SquatPhase::Standing;
                    self.bottom_streak = 0;
                } else {
                    self.track_bottom(r);
                }
            }
            SquatPhase::Bottom => {
                if angle > rise_above {
                    self.phase = SquatPhase::Ascending;
                }
            }
            SquatPhase::Ascending => {
                if angle > stand_above {
                    self.phase = SquatPhase::Standing;
                    self.reps += 1;
                    return true;
                } else if angle < c.bottom_threshold {
                    self.phase = SquatPhase::Bottom;
                }
            }
        }
        false
    }

    /// Descending 中の底判定（連続フレーム数と股関節条件）
    fn track_bottom(&mut self, r: KneeReading) {
        let hip_ok = match self.config.hip_max_at_bottom {
            Some(max_hip) => r.hip.map_or(false, |hip| hip <= max_hip),
            None => true,
        };
        if r.knee < self.config.bottom_threshold && hip_ok {
            self.bottom_streak += 1;
            if self.bottom_streak >= self.config.bottom_hold_frames {
                self.phase = SquatPhase::Bottom;
                self.bottom_streak = 0;
            }
        } else {
            self.bottom_streak = 0;
        }
    }

    fn select(&self, angles: &AngleSet) -> Option<KneeReading> {
        let left = angles.get(JointAngle::LeftKnee);
        let right = angles.get(JointAngle::RightKnee);
        let knee = pick(self.config.knee, left, right)?;
        let hip = pick(
            self.config.knee,
            angles.get(JointAngle::LeftHip),
            angles.get(JointAngle::RightHip),
        );
        Some(KneeReading { knee, hip })
    }
}

fn pick(selection: KneeSelection, left: Option<f32>, right: Option<f32>) -> Option<f32> {
    match selection {
        KneeSelection::Left => left,
        KneeSelection::Right => right,
        KneeSelection::Average => match (left, right) {
            (Some(l), Some(r)) => Some((l + r) / 2.0),
            (l, r) => l.or(r),
        },
        KneeSelection::Min => match (left, right) {
            (Some(l), Some(r)) => Some(l.min(r)),
            (l, r) => l.or(r),
        },
    }
}

/// 閾値は 0 < bottom < bottom+h < down < down+h <= 180 を満たすこと
fn validate(c: &SquatConfig) -> Result<()> {
    let finite = [c.down_threshold, c.bottom_threshold, c.hysteresis]
        .iter()
        .all(|v| v.is_finite());
    if !finite {
        return Err(PoseError::config("squat thresholds must be finite"));
    }
    if c.hysteresis < 0.0 {
        return Err(PoseError::config(format!("squat hysteresis {} < 0", c.hysteresis)));
    }
    let ordered = 0.0 < c.bottom_threshold
        && c.bottom_threshold + c.hysteresis < c.down_threshold
        && c.down_threshold + c.hysteresis <= 180.0;
    if !ordered {
        return Err(PoseError::config(format!(
            "squat thresholds not monotonic: bottom {} + hysteresis {} must be below down {} and down + hysteresis within 180",
            c.bottom_threshold, c.hysteresis, c.down_threshold
        )));
    }
    if c.bottom_hold_frames == 0 {
        return Err(PoseError::config("bottom_hold_frames must be at least 1"));
    }
    if c.max_missing_frames == 0 {
        return Err(PoseError::config("max_missing_frames must be at least 1"));
    }
    if let Some(hip) = c.hip_max_at_bottom {
        if !(0.0..=180.0).contains(&hip) {
            return Err(PoseError::config(format!("hip_max_at_bottom {} outside [0, 180]", hip)));
        }
    }
    Ok(())
}
