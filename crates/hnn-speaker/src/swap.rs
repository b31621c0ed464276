//! Speaker-dependent parameter replacement.
//!
//! Each replaceable bundle keeps a snapshot of its session-independent
//! values. Overrides are prepared when an utterance enters the cache and
//! installed when that utterance is reached; values adapted while a speaker
//! was installed are kept and reused the next time that speaker appears.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;
use hnn_core::{
    BundleKind, HnnError, HnnResult, ParameterStore, SpeakerPatternMatcher, SpeakerSwapConfig,
};
use hnn_graph::{BundleId, FeatureGraph, TensorBundle};
use tracing::{debug, info, warn};

use crate::mask::MaskMatcher;
use crate::store::DirectoryStore;

/// Values prepared for one speaker and one replaceable bundle.
#[derive(Debug)]
pub struct SpeakerOverride {
    pub speaker: String,
    pub entry: usize,
    pub bundle: TensorBundle,
}

struct ReplaceableEntry {
    bundle: BundleId,
    bundle_name: String,
    mask: String,
    store: Box<dyn ParameterStore>,
    baseline: TensorBundle,
    installed: Option<String>,
    last_prepared: Option<Arc<SpeakerOverride>>,
    adapted: HashMap<String, TensorBundle>,
}

/// Swaps speaker-dependent bundles in a [`FeatureGraph`].
pub struct SpeakerParameterSwap {
    entries: Vec<ReplaceableEntry>,
    matcher: Box<dyn SpeakerPatternMatcher>,
}

impl SpeakerParameterSwap {
    pub fn new(matcher: Box<dyn SpeakerPatternMatcher>) -> Self {
        Self {
            entries: Vec::new(),
            matcher,
        }
    }

    /// Mask matching plus one [`DirectoryStore`] per configured entry.
    pub fn from_config(config: &SpeakerSwapConfig, graph: &FeatureGraph) -> HnnResult<Self> {
        let mut swap = Self::new(Box::new(MaskMatcher));
        for entry in &config.entries {
            let store = DirectoryStore::new(entry.dir.clone(), entry.ext.clone());
            swap.add_entry(graph, &entry.bundle, &entry.mask, Box::new(store))?;
        }
        Ok(swap)
    }

    /// Mark a bundle as replaceable and snapshot its current values.
    pub fn add_entry(
        &mut self,
        graph: &FeatureGraph,
        bundle_name: &str,
        mask: &str,
        store: Box<dyn ParameterStore>,
    ) -> HnnResult<usize> {
        let bundle = graph.bundle_id(bundle_name).ok_or_else(|| {
            HnnError::Config(format!("replaceable bundle '{bundle_name}' is not in the graph"))
        })?;
        let baseline = graph
            .bundle(bundle)
            .ok_or_else(|| HnnError::Internal(format!("bundle '{bundle_name}' vanished")))?
            .clone();
        self.entries.push(ReplaceableEntry {
            bundle,
            bundle_name: bundle_name.to_string(),
            mask: mask.to_string(),
            store,
            baseline,
            installed: None,
            last_prepared: None,
            adapted: HashMap::new(),
        });
        Ok(self.entries.len() - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Speaker currently installed for an entry.
    pub fn installed_speaker(&self, entry: usize) -> Option<&str> {
        self.entries.get(entry).and_then(|e| e.installed.as_deref())
    }

    /// Load the overrides an utterance needs.
    pub fn prepare(&mut self, utterance: &str) -> HnnResult<Vec<Arc<SpeakerOverride>>> {
        let mut out = Vec::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            let speaker = self.matcher.extract(&entry.mask, utterance).ok_or_else(|| {
                HnnError::SpeakerPatternMismatch {
                    pattern: entry.mask.clone(),
                    utterance: utterance.to_string(),
                }
            })?;
            if let Some(last) = &entry.last_prepared {
                if last.speaker == speaker {
                    out.push(Arc::clone(last));
                    continue;
                }
            }
            let bundle = load_override(entry, &speaker)?;
            let prepared = Arc::new(SpeakerOverride {
                speaker,
                entry: idx,
                bundle,
            });
            entry.last_prepared = Some(Arc::clone(&prepared));
            out.push(prepared);
        }
        Ok(out)
    }

    /// Install overrides whose speaker differs from the installed one.
    /// Returns the number of bundles swapped.
    pub fn install(
        &mut self,
        graph: &mut FeatureGraph,
        overrides: &[Arc<SpeakerOverride>],
    ) -> HnnResult<usize> {
        let mut swapped = 0;
        for o in overrides {
            let entry = self
                .entries
                .get_mut(o.entry)
                .ok_or_else(|| HnnError::Internal(format!("unknown replaceable entry {}", o.entry)))?;
            if entry.installed.as_deref() == Some(o.speaker.as_str()) {
                continue;
            }
            keep_adapted(entry, graph)?;
            let source = entry.adapted.get(&o.speaker).unwrap_or(&o.bundle);
            graph
                .bundle_mut(entry.bundle)
                .ok_or_else(|| HnnError::Internal(format!("bundle '{}' vanished", entry.bundle_name)))?
                .install_from(source)?;
            info!("installed '{}' for speaker {}", entry.bundle_name, o.speaker);
            entry.installed = Some(o.speaker.clone());
            swapped += 1;
        }
        Ok(swapped)
    }

    /// Put the session-independent values back.
    pub fn restore(&mut self, graph: &mut FeatureGraph) -> HnnResult<usize> {
        let mut restored = 0;
        for entry in &mut self.entries {
            if entry.installed.is_none() {
                continue;
            }
            keep_adapted(entry, graph)?;
            graph
                .bundle_mut(entry.bundle)
                .ok_or_else(|| HnnError::Internal(format!("bundle '{}' vanished", entry.bundle_name)))?
                .install_from(&entry.baseline)?;
            entry.installed = None;
            restored += 1;
        }
        if restored > 0 {
            debug!("restored {} session-independent bundles", restored);
        }
        Ok(restored)
    }

    /// Adapted values per speaker, keyed by bundle name.
    pub fn adapted_by_speaker(&self) -> HashMap<String, HashMap<String, Tensor>> {
        let mut out: HashMap<String, HashMap<String, Tensor>> = HashMap::new();
        for entry in &self.entries {
            for (speaker, bundle) in &entry.adapted {
                out.entry(speaker.clone())
                    .or_default()
                    .insert(entry.bundle_name.clone(), bundle.values().clone());
            }
        }
        out
    }

    /// Write every adapted speaker into `store`.
    pub fn save_adapted(&self, store: &mut DirectoryStore) -> HnnResult<usize> {
        let adapted = self.adapted_by_speaker();
        for (speaker, bundles) in &adapted {
            store.save(speaker, bundles)?;
        }
        Ok(adapted.len())
    }
}

fn load_override(entry: &mut ReplaceableEntry, speaker: &str) -> HnnResult<TensorBundle> {
    let values = match entry.store.load(speaker, &entry.bundle_name)? {
        Some(values) => {
            if values.dims() != entry.baseline.dims() {
                return Err(HnnError::DimensionMismatch(format!(
                    "bundle '{}' of speaker '{speaker}' is {:?}, expected {:?}",
                    entry.bundle_name,
                    values.dims(),
                    entry.baseline.dims()
                )));
            }
            values
        }
        None => {
            warn!(
                "no '{}' parameters for speaker '{}', starting from shared values",
                entry.bundle_name, speaker
            );
            entry.baseline.values().clone()
        }
    };
    let mut bundle = TensorBundle::new(
        format!("{}+{speaker}", entry.bundle_name),
        BundleKind::SessionDependent,
        values,
    );
    for companion in entry.baseline.present_companions() {
        bundle.ensure_companion(companion)?;
    }
    Ok(bundle)
}

fn keep_adapted(entry: &mut ReplaceableEntry, graph: &FeatureGraph) -> HnnResult<()> {
    if let Some(previous) = &entry.installed {
        let current = graph
            .bundle(entry.bundle)
            .ok_or_else(|| HnnError::Internal(format!("bundle '{}' vanished", entry.bundle_name)))?;
        entry.adapted.insert(previous.clone(), current.clone());
    }
    Ok(())
}
