//! Label sources backed by HTK files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use hnn_core::{
    HnnError, HnnResult, LabelKind, LabelSegment, LabelSource, UtteranceLabels,
    targets_from_segments,
};
use tracing::debug;

use crate::htk::read_htk_params;

/// HTK frame period of 10 ms in 100 ns units.
pub const DEFAULT_SAMPLE_PERIOD: u64 = 100_000;

/// Label name to output-node index.
#[derive(Debug, Clone, Default)]
pub struct TargetList {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl TargetList {
    pub fn from_names<I, S>(names: I) -> HnnResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        for name in names {
            let name = name.into();
            if list.index.contains_key(&name) {
                return Err(HnnError::Config(format!("target '{name}' listed twice")));
            }
            list.index.insert(name.clone(), list.names.len());
            list.names.push(name);
        }
        Ok(list)
    }

    /// One target name per non-blank line.
    pub fn from_path(path: impl AsRef<Path>) -> HnnResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_names(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        )
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn time_to_frame(time: u64, sample_period: u64) -> usize {
    ((time + sample_period / 2) / sample_period) as usize
}

/// Parse an HTK label file (`start end name [...]`, times in 100 ns) into
/// frame segments.
pub fn read_label_segments(
    path: impl AsRef<Path>,
    targets: &TargetList,
    sample_period: u64,
) -> HnnResult<Vec<LabelSegment>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let mut segments = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line == "." || line.starts_with("#!") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(HnnError::InvalidData(format!(
                "{}:{}: expected 'start end label'",
                path.display(),
                lineno + 1
            )));
        }
        let parse_time = |s: &str| {
            s.parse::<u64>().map_err(|_| {
                HnnError::InvalidData(format!(
                    "{}:{}: bad time '{s}'",
                    path.display(),
                    lineno + 1
                ))
            })
        };
        let start = parse_time(fields[0])?;
        let end = parse_time(fields[1])?;
        let target = targets.index(fields[2]).ok_or_else(|| {
            HnnError::InvalidData(format!(
                "{}:{}: label '{}' is not in the target list",
                path.display(),
                lineno + 1,
                fields[2]
            ))
        })?;
        segments.push(LabelSegment {
            start: time_to_frame(start, sample_period),
            end: time_to_frame(end, sample_period),
            target,
        });
    }
    Ok(segments)
}

/// Per-frame targets from `<dir>/<name>.<ext>` label files.
#[derive(Debug, Clone)]
pub struct HtkLabelSource {
    dir: PathBuf,
    ext: String,
    targets: TargetList,
    sample_period: u64,
}

impl HtkLabelSource {
    pub fn new(dir: impl Into<PathBuf>, ext: impl Into<String>, targets: TargetList) -> Self {
        Self {
            dir: dir.into(),
            ext: ext.into(),
            targets,
            sample_period: DEFAULT_SAMPLE_PERIOD,
        }
    }

    pub fn with_sample_period(mut self, period: u64) -> Self {
        self.sample_period = period.max(1);
        self
    }

    pub fn targets(&self) -> &TargetList {
        &self.targets
    }
}

impl LabelSource for HtkLabelSource {
    fn kind(&self) -> LabelKind {
        LabelKind::Targets
    }

    fn load(&mut self, name: &str, frame_count: usize) -> HnnResult<UtteranceLabels> {
        let path = self.dir.join(format!("{name}.{}", self.ext));
        let segments = read_label_segments(&path, &self.targets, self.sample_period)?;
        debug!("{}: {} label segments", path.display(), segments.len());
        Ok(UtteranceLabels::Targets(targets_from_segments(
            name,
            &segments,
            frame_count,
        )?))
    }
}

/// Feature labels from a parallel set of HTK parameter files.
#[derive(Debug, Clone)]
pub struct FeatureLabelSource {
    dir: PathBuf,
    ext: String,
}

impl FeatureLabelSource {
    pub fn new(dir: impl Into<PathBuf>, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            ext: ext.into(),
        }
    }
}

impl LabelSource for FeatureLabelSource {
    fn kind(&self) -> LabelKind {
        LabelKind::Features
    }

    fn load(&mut self, name: &str, frame_count: usize) -> HnnResult<UtteranceLabels> {
        let (_, frames) = read_htk_params(self.dir.join(format!("{name}.{}", self.ext)))?;
        if frames.rows() != frame_count {
            return Err(HnnError::DimensionMismatch(format!(
                "feature labels of '{name}' have {} frames, utterance has {frame_count}",
                frames.rows()
            )));
        }
        Ok(UtteranceLabels::Features(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phones() -> TargetList {
        TargetList::from_names(["sil", "a", "b"]).expect("targets")
    }

    #[test]
    fn test_target_list_rejects_duplicates() {
        assert!(TargetList::from_names(["a", "a"]).is_err());
        let list = phones();
        assert_eq!(list.index("b"), Some(2));
        assert_eq!(list.name(0), Some("sil"));
        assert_eq!(list.index("zz"), None);
    }

    #[test]
    fn test_label_file_to_targets() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(
            dir.path().join("u1.lab"),
            "0 200000 sil\n200000 500000 a -12.5\n500000 600000 b\n",
        )
        .expect("write");

        let mut source = HtkLabelSource::new(dir.path(), "lab", phones());
        match source.load("u1", 6).expect("labels") {
            UtteranceLabels::Targets(t) => assert_eq!(t, vec![0, 0, 1, 1, 1, 2]),
            other => panic!("unexpected labels {other:?}"),
        }
        assert!(matches!(
            source.load("u1", 7),
            Err(HnnError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_gap_in_label_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("u2.lab"), "0 200000 sil\n300000 500000 a\n").expect("write");
        let mut source = HtkLabelSource::new(dir.path(), "lab", phones());
        assert!(matches!(
            source.load("u2", 5),
            Err(HnnError::DiscontinuousUtterance { .. })
        ));
    }

    #[test]
    fn test_unknown_label() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("u3.lab"), "0 200000 zz\n").expect("write");
        let mut source = HtkLabelSource::new(dir.path(), "lab", phones());
        assert!(matches!(
            source.load("u3", 2),
            Err(HnnError::InvalidData(_))
        ));
    }
}
