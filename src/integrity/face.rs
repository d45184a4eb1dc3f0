use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::warning::WarningKind;
use crate::error::Result;
use crate::peer::MediaStream;

/// One result from the external face detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceSample {
    pub face_count: u32,
    pub is_looking_away: bool,
}

/// External face detector, sampled at a fixed interval.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, stream: &MediaStream) -> Result<FaceSample>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceCondition {
    #[default]
    Clear,
    NoFace,
    MultipleFaces,
    LookingAway,
}

impl FaceCondition {
    pub fn of(sample: FaceSample) -> Self {
        match sample.face_count {
            0 => FaceCondition::NoFace,
            1 if sample.is_looking_away => FaceCondition::LookingAway,
            1 => FaceCondition::Clear,
            _ => FaceCondition::MultipleFaces,
        }
    }

    pub fn warning(self) -> Option<WarningKind> {
        match self {
            FaceCondition::Clear => None,
            FaceCondition::NoFace => Some(WarningKind::NoFace),
            FaceCondition::MultipleFaces => Some(WarningKind::MultipleFaces),
            FaceCondition::LookingAway => Some(WarningKind::LookingAway),
        }
    }
}

/// Edge detector over face samples: a warning fires when the condition
/// changes into a violation, never again while it persists.
#[derive(Debug, Default)]
pub struct FaceWatch {
    current: FaceCondition,
}

impl FaceWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> FaceCondition {
        self.current
    }

    pub fn observe(&mut self, sample: FaceSample) -> Option<WarningKind> {
        let next = FaceCondition::of(sample);
        if next == self.current {
            return None;
        }
        self.current = next;
        next.warning()
    }
}
