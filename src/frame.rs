use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::pose::Pose;

/// 1フレーム分のキーポイント入力
///
/// JSON Lines の1行: `{"id": 3, "keypoints": [{"joint": "nose", "x": 0.5, "y": 0.1, "score": 0.9}, ...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// 単調増加するフレーム番号
    pub id: u64,
    #[serde(rename = "keypoints")]
    pub pose: Pose,
}

impl Frame {
    pub fn new(id: u64, pose: Pose) -> Self {
        Self { id, pose }
    }
}

/// JSON Lines を1行ずつフレームとして読む。空行は飛ばす
pub fn read_frames<R: BufRead>(reader: R) -> impl Iterator<Item = anyhow::Result<Frame>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(i, line)| match line {
            Ok(l) if l.trim().is_empty() => None,
            Ok(l) => Some(parse_line(&l, i + 1)),
            Err(e) => Some(Err(anyhow::Error::new(e).context("Failed to read frame stream"))),
        })
}

/// 壊れた行・不正なキーポイントの行は警告して飛ばす。読み込みエラーだけを返す
pub fn read_valid_frames<R: BufRead>(reader: R) -> impl Iterator<Item = anyhow::Result<Frame>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(i, line)| match line {
            Ok(l) if l.trim().is_empty() => None,
            Ok(l) => match parse_line(&l, i + 1) {
                Ok(frame) => Some(Ok(frame)),
                Err(e) => {
                    tracing::warn!(line = i + 1, error = %format!("{:#}", e), "invalid frame skipped");
                    None
                }
            },
            Err(e) => Some(Err(anyhow::Error::new(e).context("Failed to read frame stream"))),
        })
}

fn parse_line(line: &str, number: usize) -> anyhow::Result<Frame> {
    serde_json::from_str::<Frame>(line).with_context(|| format!("Invalid frame on line {}", number))
}

#[derive(Debug, Default)]
struct Latest {
    frame: Option<Frame>,
    /// 最後に受け付けたID。取り出し後も残る
    published: Option<u64>,
}

/// 最新フレームだけを保持する受け渡し口
///
/// 書き込み側は上書きし、読み出し側は前回より新しいフレームだけを受け取る。
/// 古いフレームは捨てられ、キューには積まれない。
#[derive(Debug, Clone, Default)]
pub struct FrameSlot {
    latest: Arc<Mutex<Latest>>,
    frame_id: Arc<AtomicU64>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// フレームを置く。これまでに置いたどのフレームよりも新しくなければ捨てる
    pub fn publish(&self, frame: Frame) -> bool {
        let mut guard = self.lock();
        if let Some(last) = guard.published {
            if frame.id <= last {
                tracing::trace!(id = frame.id, last, "stale frame dropped");
                return false;
            }
        }
        guard.published = Some(frame.id);
        self.frame_id.store(frame.id, Ordering::Release);
        guard.frame = Some(frame);
        true
    }

    /// 最後に置かれたフレームのID。まだ無ければ0
    pub fn frame_id(&self) -> u64 {
        self.frame_id.load(Ordering::Acquire)
    }

    /// `last_id` より新しいフレームがあれば取り出す
    pub fn take_newer(&self, last_id: Option<u64>) -> Option<Frame> {
        if let Some(last) = last_id {
            if self.frame_id() <= last {
                return None;
            }
        }
        let mut guard = self.lock();
        match guard.frame.as_ref() {
            Some(f) if last_id.map_or(true, |last| f.id > last) => guard.frame.take(),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Latest> {
        // 書き込み側がパニックしても中身は1フレームなのでそのまま使う
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::keypoint::fixtures::standing_pose;
    use std::io::Cursor;
    use std::thread;

    #[test]
    fn test_frame_json() {
        let line = r#"{"id": 7, "keypoints": [{"joint": "left_hip", "x": 0.5, "y": 0.6, "score": 0.8}]}"#;
        let frame: Frame = serde_json::from_str(line).unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(frame.pose.len(), 1);
        assert_eq!(frame.pose.get(crate::pose::JointId::LeftHip).unwrap().z, None);
    }

    #[test]
    fn test_read_frames_reports_line() {
        let input = "{\"id\": 1, \"keypoints\": []}\n\nnot json\n";
        let frames: Vec<_> = read_frames(Cursor::new(input)).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        let err = frames[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_slot_keeps_latest() {
        let slot = FrameSlot::new();
        assert!(slot.take_newer(None).is_none());
        assert!(slot.publish(Frame::new(1, standing_pose())));
        assert!(slot.publish(Frame::new(2, standing_pose())));
        assert!(!slot.publish(Frame::new(2, standing_pose())));
        assert_eq!(slot.frame_id(), 2);

        let frame = slot.take_newer(Some(1)).unwrap();
        assert_eq!(frame.id, 2);
        // 取り出したら空になる
        assert!(slot.take_newer(Some(1)).is_none());
        assert!(slot.take_newer(Some(2)).is_none());
    }

    #[test]
    fn test_read_valid_frames_skips_bad_lines() {
        let input = concat!(
            "{\"id\": 1, \"keypoints\": [{\"joint\": \"left_hip\", \"x\": 0.5, \"y\": 0.6, \"score\": 0.8}]}\n",
            "{\"id\": 2, \"keypoints\": [{\"joint\": \"left_hip\", \"x\": 0.5, \"y\": 0.6, \"score\": 1.2}]}\n",
            "not json\n",
            "{\"id\": 3, \"keypoints\": []}\n",
        );
        let ids: Vec<u64> = read_valid_frames(Cursor::new(input)).map(|f| f.unwrap().id).collect();
        assert_eq!(ids, vec![1, 3]);
        // 厳密版は同じ行でエラーを返す
        assert!(read_frames(Cursor::new(input)).nth(1).unwrap().is_err());
    }

    #[test]
    fn test_slot_rejects_older_after_take() {
        let slot = FrameSlot::new();
        assert!(slot.publish(Frame::new(5, standing_pose())));
        assert_eq!(slot.take_newer(None).unwrap().id, 5);
        // 空になっても過去のIDは受け付けない
        assert!(!slot.publish(Frame::new(3, standing_pose())));
        assert_eq!(slot.frame_id(), 5);
        assert!(slot.take_newer(None).is_none());
        assert!(slot.publish(Frame::new(6, standing_pose())));
        assert_eq!(slot.take_newer(Some(5)).unwrap().id, 6);
    }

    #[test]
    fn test_slot_across_threads() {
        let slot = FrameSlot::new();
        let writer = slot.clone();
        let handle = thread::spawn(move || {
            for id in 1..=100 {
                writer.publish(Frame::new(id, standing_pose()));
            }
        });
        handle.join().unwrap();

        let frame = slot.take_newer(None).unwrap();
        assert_eq!(frame.id, 100);
    }
}
