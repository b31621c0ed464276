//! In-memory observation and label sources.

use std::collections::HashMap;
use std::io;

use hnn_core::{
    FrameMatrix, HnnError, HnnResult, LabelKind, LabelSource, Observation, ObservationReader,
    UtteranceLabels,
};

fn not_found(what: &str, name: &str) -> HnnError {
    HnnError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no {what} for utterance '{name}'"),
    ))
}

/// Observations held in a map, keyed by utterance name and stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryObservationReader {
    observations: HashMap<(String, usize), Observation>,
    reads: usize,
}

impl MemoryObservationReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add frames for stream 0.
    pub fn insert(&mut self, name: impl Into<String>, frames: FrameMatrix) {
        self.insert_observation(name, 0, Observation::new(frames));
    }

    pub fn insert_observation(
        &mut self,
        name: impl Into<String>,
        stream: usize,
        observation: Observation,
    ) {
        self.observations.insert((name.into(), stream), observation);
    }

    pub fn with(mut self, name: impl Into<String>, frames: FrameMatrix) -> Self {
        self.insert(name, frames);
        self
    }

    /// Number of successful reads so far.
    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl ObservationReader for MemoryObservationReader {
    fn read(&mut self, name: &str, stream: usize) -> HnnResult<Observation> {
        let obs = self
            .observations
            .get(&(name.to_string(), stream))
            .cloned()
            .ok_or_else(|| not_found("observation", name))?;
        self.reads += 1;
        Ok(obs)
    }
}

/// Labels held in a map.
#[derive(Debug, Clone)]
pub struct MemoryLabelSource {
    kind: LabelKind,
    labels: HashMap<String, UtteranceLabels>,
}

impl MemoryLabelSource {
    pub fn new(kind: LabelKind) -> Self {
        Self {
            kind,
            labels: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, labels: UtteranceLabels) {
        self.labels.insert(name.into(), labels);
    }

    pub fn with_targets(mut self, name: impl Into<String>, targets: Vec<usize>) -> Self {
        self.insert(name, UtteranceLabels::Targets(targets));
        self
    }
}

impl LabelSource for MemoryLabelSource {
    fn kind(&self) -> LabelKind {
        self.kind
    }

    fn load(&mut self, name: &str, _frame_count: usize) -> HnnResult<UtteranceLabels> {
        self.labels
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("labels", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_counts_reads() {
        let frames = FrameMatrix::new(vec![1.0, 2.0], 2, 1).expect("frames");
        let mut reader = MemoryObservationReader::new().with("u", frames.clone());
        assert_eq!(reader.read("u", 0).expect("read").frames, frames);
        assert!(reader.read("u", 1).is_err());
        assert!(reader.read("v", 0).is_err());
        assert_eq!(reader.reads(), 1);
    }

    #[test]
    fn test_label_source_kind() {
        let mut source = MemoryLabelSource::new(LabelKind::Targets).with_targets("u", vec![1, 2]);
        assert_eq!(source.kind(), LabelKind::Targets);
        assert_eq!(source.load("u", 2).expect("labels").frame_count(), Some(2));
        assert!(source.load("x", 2).is_err());
    }
}
