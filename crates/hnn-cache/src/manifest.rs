//! Utterance manifest (one entry per line).

use std::path::Path;

use hnn_core::{HnnError, HnnResult};

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<String>,
}

impl Manifest {
    /// Read a manifest file; blank lines are ignored.
    pub fn from_path(path: impl AsRef<Path>) -> HnnResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let manifest = Self::from_names(text.lines());
        if manifest.is_empty() {
            return Err(HnnError::Config(format!("manifest {:?} is empty", path)));
        }
        Ok(manifest)
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = names
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, position: usize) -> Option<&str> {
        self.entries.get(position).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_blank_lines_skipped() {
        let m = Manifest::from_names(["a.plp", "", "  b.plp  ", "\t"]);
        assert_eq!(m.len(), 2);
        assert_eq!(m.name(1), Some("b.plp"));
    }

    #[test]
    fn test_empty_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file).expect("write");
        assert!(Manifest::from_path(file.path()).is_err());
    }
}
