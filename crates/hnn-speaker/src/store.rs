//! Per-speaker parameter files in safetensors format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use hnn_core::{HnnError, HnnResult, ParameterStore};
use tracing::debug;

/// Reads `<dir>/<speaker>.<ext>`; a tensor is looked up as
/// `"{bundle}+{speaker}"` first and then as `"{bundle}"`.
#[derive(Debug)]
pub struct DirectoryStore {
    dir: PathBuf,
    ext: String,
    device: Device,
    loaded: HashMap<String, HashMap<String, Tensor>>,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            ext: ext.into(),
            device: Device::Cpu,
            loaded: HashMap::new(),
        }
    }

    pub fn path_for(&self, speaker: &str) -> PathBuf {
        self.dir.join(format!("{speaker}.{}", self.ext))
    }

    /// Tensor key used for a speaker's copy of a bundle.
    pub fn key(bundle: &str, speaker: &str) -> String {
        format!("{bundle}+{speaker}")
    }

    fn speaker_file(&mut self, speaker: &str) -> HnnResult<Option<&HashMap<String, Tensor>>> {
        if !self.loaded.contains_key(speaker) {
            let path = self.path_for(speaker);
            if !path.exists() {
                debug!("no parameter file for speaker '{}' at {:?}", speaker, path);
                return Ok(None);
            }
            let tensors = candle_core::safetensors::load(&path, &self.device)?;
            self.loaded.insert(speaker.to_string(), tensors);
        }
        Ok(self.loaded.get(speaker))
    }

    /// Write a speaker's bundles, replacing any cached copy.
    pub fn save(&mut self, speaker: &str, bundles: &HashMap<String, Tensor>) -> HnnResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let tensors: HashMap<String, Tensor> = bundles
            .iter()
            .map(|(name, t)| (Self::key(name, speaker), t.clone()))
            .collect();
        let path = self.path_for(speaker);
        candle_core::safetensors::save(&tensors, &path)?;
        self.loaded.remove(speaker);
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ParameterStore for DirectoryStore {
    fn load(&mut self, speaker: &str, bundle: &str) -> HnnResult<Option<Tensor>> {
        let Some(file) = self.speaker_file(speaker)? else {
            return Ok(None);
        };
        let tensor = file
            .get(&Self::key(bundle, speaker))
            .or_else(|| file.get(bundle))
            .cloned();
        if tensor.is_none() && !file.is_empty() {
            return Err(HnnError::Config(format!(
                "parameter file of speaker '{speaker}' has no tensor for bundle '{bundle}'"
            )));
        }
        Ok(tensor)
    }
}
