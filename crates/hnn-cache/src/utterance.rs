//! Per-utterance cache record.

use std::sync::Arc;

use hnn_core::{FrameMatrix, HnnError, HnnResult, Observation, UtteranceLabels};
use hnn_speaker::SpeakerOverride;

/// One manifest entry and, while resident, its data.
#[derive(Debug, Clone)]
pub struct UttElem {
    pub name: String,
    /// Position in the manifest.
    pub position: usize,
    pub frame_count: usize,
    /// Frames handed out in batches that have since been released.
    pub frames_used: usize,
    pub observation: Option<Observation>,
    pub labels: UtteranceLabels,
    pub overrides: Vec<Arc<SpeakerOverride>>,
    /// Failed to load (non-strict mode) or had no frames.
    pub skipped: bool,
}

impl UttElem {
    pub fn new(name: impl Into<String>, position: usize) -> Self {
        Self {
            name: name.into(),
            position,
            frame_count: 0,
            frames_used: 0,
            observation: None,
            labels: UtteranceLabels::None,
            overrides: Vec::new(),
            skipped: false,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.observation.is_some()
    }

    /// Frames of a resident utterance.
    pub fn frames(&self) -> HnnResult<&FrameMatrix> {
        self.observation
            .as_ref()
            .map(|o| &o.frames)
            .ok_or_else(|| {
                HnnError::Internal(format!("utterance '{}' is not resident", self.name))
            })
    }

    pub fn aux(&self, index: usize) -> HnnResult<&[f32]> {
        let obs = self.observation.as_ref().ok_or_else(|| {
            HnnError::Internal(format!("utterance '{}' is not resident", self.name))
        })?;
        obs.aux.get(index).map(|v| v.as_slice()).ok_or_else(|| {
            HnnError::DimensionMismatch(format!(
                "utterance '{}' has {} auxiliary vectors, index {index} requested",
                self.name,
                obs.aux.len()
            ))
        })
    }

    /// Drop frames, labels and overrides; keeps the bookkeeping.
    pub fn release(&mut self) {
        self.observation = None;
        self.labels = UtteranceLabels::None;
        self.overrides.clear();
    }

    /// Back to the never-loaded state.
    pub fn clear(&mut self) {
        self.release();
        self.frame_count = 0;
        self.frames_used = 0;
        self.skipped = false;
    }
}
