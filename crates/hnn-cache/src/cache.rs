//! Streaming utterance cache.
//!
//! Utterances are loaded in manifest order until the resident frame count
//! reaches the ceiling. A visiting order over the loaded prefix of the
//! manifest is extended (and, for random policies, shuffled) segment by
//! segment as more utterances arrive; entries already in the order are never
//! reshuffled. Frames are released once every frame of their utterance has
//! been handed out in a batch that has been consumed.

use hnn_core::{
    CacheConfig, FrameIndex, FrameMatrix, HnnError, HnnResult, LabelSource, ObservationReader,
    ShufflePolicy, StreamCommand, UtteranceLabels, VisitPolicy,
};
use hnn_graph::FeatureGraph;
use hnn_speaker::SpeakerParameterSwap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::manifest::Manifest;
use crate::shuffle::{lfsr_permute, random_exchange};
use crate::utterance::UttElem;

/// Frames selected for one mini-batch.
#[derive(Debug, Clone, Default)]
pub struct CacheBatch {
    /// Running batch number within the cache's lifetime.
    pub index: u64,
    pub frames: Vec<FrameIndex>,
    /// `true` where the frame is the last one of its utterance.
    pub utterance_end: Vec<bool>,
    /// One command per frame, or per stream slot for parallel policies.
    pub commands: Vec<StreamCommand>,
    /// No frames remain after this batch in the current epoch.
    pub is_final: bool,
}

impl CacheBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub loaded: usize,
    pub released: usize,
    pub skipped: usize,
    pub batches: u64,
    pub frames: usize,
}

pub struct StreamingCache {
    config: CacheConfig,
    manifest: Manifest,
    stream: usize,
    reader: Box<dyn ObservationReader>,
    labels: Option<Box<dyn LabelSource>>,
    speakers: Option<SpeakerParameterSwap>,

    utterances: Vec<UttElem>,
    frame_dim: Option<usize>,
    next_unloaded: usize,

    order: Vec<usize>,
    order_start: usize,
    order_end: usize,
    order_ptr: usize,
    frame_order: Vec<FrameIndex>,
    frame_ptr: usize,
    pointers: Vec<Option<FrameIndex>>,

    pending: Vec<FrameIndex>,
    resident_frames: usize,
    peak_resident: usize,
    epoch: u32,
    rng: StdRng,
    initialized: bool,
    finished: bool,
    stats: CacheStats,
}

impl StreamingCache {
    /// Create a cache over `manifest`. Nothing is loaded until the first batch.
    pub fn open(
        manifest: Manifest,
        reader: Box<dyn ObservationReader>,
        labels: Option<Box<dyn LabelSource>>,
        stream: usize,
        config: CacheConfig,
    ) -> HnnResult<Self> {
        config.validate()?;
        if manifest.is_empty() {
            return Err(HnnError::Config("manifest is empty".into()));
        }
        let utterances = manifest
            .iter()
            .enumerate()
            .map(|(i, name)| UttElem::new(name, i))
            .collect();
        let rng = StdRng::seed_from_u64(config.seed);
        debug!(
            "cache opened: {} utterances, policy {}, shuffle {}, ceiling {} frames",
            manifest.len(),
            config.visit_policy,
            config.shuffle_policy,
            config.frame_ceiling
        );
        Ok(Self {
            config,
            manifest,
            stream,
            reader,
            labels,
            speakers: None,
            utterances,
            frame_dim: None,
            next_unloaded: 0,
            order: Vec::new(),
            order_start: 0,
            order_end: 0,
            order_ptr: 0,
            frame_order: Vec::new(),
            frame_ptr: 0,
            pointers: Vec::new(),
            pending: Vec::new(),
            resident_frames: 0,
            peak_resident: 0,
            epoch: 0,
            rng,
            initialized: false,
            finished: false,
            stats: CacheStats::default(),
        })
    }

    /// Prepare speaker overrides for every utterance as it is loaded.
    pub fn with_speaker_swap(mut self, swap: SpeakerParameterSwap) -> Self {
        self.speakers = Some(swap);
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn stream(&self) -> usize {
        self.stream
    }

    pub fn utterance(&self, idx: usize) -> Option<&UttElem> {
        self.utterances.get(idx)
    }

    /// Frames of a resident utterance.
    pub fn frames(&self, idx: usize) -> HnnResult<&FrameMatrix> {
        self.utterances
            .get(idx)
            .ok_or_else(|| HnnError::Internal(format!("utterance index {idx} out of range")))?
            .frames()
    }

    pub fn labels(&self, idx: usize) -> Option<&UtteranceLabels> {
        self.utterances.get(idx).map(|u| &u.labels)
    }

    /// Width of the frames loaded so far.
    pub fn frame_dim(&self) -> Option<usize> {
        self.frame_dim
    }

    pub fn resident_frames(&self) -> usize {
        self.resident_frames
    }

    pub fn peak_resident_frames(&self) -> usize {
        self.peak_resident
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Set the epoch used by the LFSR shuffle; takes effect on the next refresh.
    pub fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn speaker_swap(&self) -> Option<&SpeakerParameterSwap> {
        self.speakers.as_ref()
    }

    /// Utterance under the single visiting pointer (utterance policies only).
    pub fn current_utterance(&self) -> HnnResult<Option<&UttElem>> {
        if !self.config.visit_policy.is_utterance_level() {
            return Err(HnnError::Config(format!(
                "current utterance is undefined for policy {}",
                self.config.visit_policy
            )));
        }
        Ok(self
            .pending
            .first()
            .and_then(|f| self.utterances.get(f.utterance)))
    }

    // -- loading ------------------------------------------------------------

    fn load_next(&mut self) -> HnnResult<()> {
        let position = self.next_unloaded;
        let name = self.utterances[position].name.clone();
        self.next_unloaded += 1;
        match self.read_utterance(position, &name) {
            Ok(()) => Ok(()),
            Err(e) if self.config.strict => Err(e.at_utterance(&name, position)),
            Err(e) => {
                warn!("skipping utterance '{}' (entry {}): {}", name, position, e);
                let utt = &mut self.utterances[position];
                utt.clear();
                utt.skipped = true;
                self.stats.skipped += 1;
                Ok(())
            }
        }
    }

    fn read_utterance(&mut self, position: usize, name: &str) -> HnnResult<()> {
        let observation = self.reader.read(name, self.stream)?;
        let frame_count = observation.frame_count();
        if frame_count == 0 {
            warn!("utterance '{}' has no frames", name);
            let utt = &mut self.utterances[position];
            utt.clear();
            utt.skipped = true;
            self.stats.skipped += 1;
            return Ok(());
        }

        let dim = observation.frames.cols();
        match self.frame_dim {
            Some(expected) if expected != dim => {
                return Err(HnnError::DimensionMismatch(format!(
                    "utterance '{name}' has {dim}-dimensional frames, expected {expected}"
                )));
            }
            _ => self.frame_dim = Some(dim),
        }
        if let Some((frame, col)) = observation.frames.first_non_finite() {
            return Err(HnnError::InvalidData(format!(
                "utterance '{name}' frame {frame} value {col} is not finite"
            )));
        }

        let labels = match self.labels.as_mut() {
            Some(source) => {
                let labels = source.load(name, frame_count)?;
                if let Some(n) = labels.frame_count() {
                    if n != frame_count {
                        return Err(HnnError::DimensionMismatch(format!(
                            "labels of '{name}' have {n} frames, utterance has {frame_count}"
                        )));
                    }
                }
                labels
            }
            None => UtteranceLabels::None,
        };
        let overrides = match self.speakers.as_mut() {
            Some(swap) => swap.prepare(name)?,
            None => Vec::new(),
        };

        let utt = &mut self.utterances[position];
        utt.frame_count = frame_count;
        utt.frames_used = 0;
        utt.observation = Some(observation);
        utt.labels = labels;
        utt.overrides = overrides;
        utt.skipped = false;

        self.resident_frames += frame_count;
        self.peak_resident = self.peak_resident.max(self.resident_frames);
        self.stats.loaded += 1;
        debug!(
            "loaded '{}' ({} frames, {} resident)",
            name, frame_count, self.resident_frames
        );
        Ok(())
    }

    /// Load utterances while below the ceiling.
    fn fill(&mut self) -> HnnResult<()> {
        while self.next_unloaded < self.utterances.len()
            && self.resident_frames < self.config.frame_ceiling
        {
            self.load_next()?;
        }
        Ok(())
    }

    // -- orders -------------------------------------------------------------

    fn shuffle_segment<T: Clone>(&mut self, items: &mut [T]) -> HnnResult<()> {
        match self.config.shuffle_policy {
            ShufflePolicy::RandomExchange => random_exchange(items, &mut self.rng, false),
            ShufflePolicy::FixedRangeExchange => random_exchange(items, &mut self.rng, true),
            ShufflePolicy::Lfsr => lfsr_permute(items, self.config.seed, self.epoch)?,
        }
        Ok(())
    }

    /// Extend the order to newly loaded utterances. `false` if there are none.
    fn refresh_order(&mut self) -> HnnResult<bool> {
        if self.order_end == self.next_unloaded {
            return Ok(false);
        }
        self.order_start = self.order_end;
        self.order_end = self.next_unloaded;
        if self.config.visit_policy.shuffles_utterances() {
            let mut segment = self.order[self.order_start..self.order_end].to_vec();
            self.shuffle_segment(&mut segment)?;
            self.order[self.order_start..self.order_end].copy_from_slice(&segment);
        }
        debug!("order extended to [{}, {})", self.order_start, self.order_end);
        Ok(true)
    }

    /// Frame order over the newest order segment (frame-random policy).
    fn rebuild_frame_order(&mut self) -> HnnResult<()> {
        let mut frames = Vec::new();
        for &utt in &self.order[self.order_start..self.order_end] {
            let u = &self.utterances[utt];
            if u.skipped {
                continue;
            }
            frames.extend((0..u.frame_count).map(|f| FrameIndex::new(utt, f)));
        }
        self.shuffle_segment(&mut frames)?;
        self.frame_order = frames;
        self.frame_ptr = 0;
        self.order_ptr = self.order_end;
        Ok(())
    }

    /// Every utterance of the manifest has been claimed by a pointer.
    fn all_claimed(&self) -> bool {
        self.order_ptr >= self.utterances.len()
    }

    /// Next utterance from the order, or `None` once the manifest is done.
    ///
    /// Fails with `CacheExhausted` when the order is drained and the
    /// resident frames already reach the ceiling, so nothing more may load
    /// before the next eviction.
    fn claim_next(&mut self) -> HnnResult<Option<FrameIndex>> {
        loop {
            if self.all_claimed() {
                return Ok(None);
            }
            if self.order_ptr == self.order_end && !self.refresh_order()? {
                // nothing new is indexed yet: pull one more utterance in
                if self.next_unloaded < self.utterances.len()
                    && self.resident_frames < self.config.frame_ceiling
                {
                    self.load_next()?;
                }
                if !self.refresh_order()? {
                    return Err(HnnError::CacheExhausted(format!(
                        "no utterance to claim at order position {} of {}, {} frames resident",
                        self.order_ptr,
                        self.utterances.len(),
                        self.resident_frames
                    )));
                }
            }
            let utt = self.order[self.order_ptr];
            self.order_ptr += 1;
            if !self.utterances[utt].skipped {
                return Ok(Some(FrameIndex::new(utt, 0)));
            }
        }
    }

    /// Move a frame pointer forward, claiming a new utterance at the end.
    fn advance(&mut self, slot: usize) -> HnnResult<()> {
        let next = match self.pointers[slot] {
            Some(p) if p.frame + 1 < self.utterances[p.utterance].frame_count => {
                Some(FrameIndex::new(p.utterance, p.frame + 1))
            }
            _ => match self.claim_next() {
                Ok(next) => next,
                Err(HnnError::CacheExhausted(reason)) => {
                    debug!("pointer {} waits for eviction: {}", slot, reason);
                    None
                }
                Err(e) => return Err(e),
            },
        };
        self.pointers[slot] = next;
        Ok(())
    }

    fn init(&mut self) -> HnnResult<()> {
        self.order = (0..self.utterances.len()).collect();
        self.order_start = 0;
        self.order_end = 0;
        self.order_ptr = 0;
        self.fill()?;
        self.refresh_order()?;

        match self.config.visit_policy {
            VisitPolicy::FrameRandom => self.rebuild_frame_order()?,
            VisitPolicy::Original | VisitPolicy::UtteranceRandom => {
                self.pointers = vec![None];
                self.advance(0)?;
            }
            VisitPolicy::ParallelOriginal | VisitPolicy::ParallelRandom => {
                self.pointers = vec![None; self.config.batch_size];
                for slot in 0..self.pointers.len() {
                    self.advance(slot)?;
                }
            }
        }
        self.initialized = true;
        Ok(())
    }

    // -- batches ------------------------------------------------------------

    /// Evict the previous batch, refill and select the next frames.
    pub fn next_batch(&mut self) -> HnnResult<CacheBatch> {
        self.next_batch_within(None)
    }

    /// Like [`StreamingCache::next_batch`]; with `Some(n)` an utterance-policy
    /// batch stops after `n` utterances have ended inside it.
    pub fn next_batch_within(&mut self, max_utterances: Option<usize>) -> HnnResult<CacheBatch> {
        if !self.initialized {
            self.init()?;
        }
        self.release_batch()?;
        if self.finished {
            return Ok(CacheBatch {
                index: self.stats.batches,
                is_final: true,
                ..CacheBatch::default()
            });
        }
        self.fill()?;
        if self.config.visit_policy != VisitPolicy::FrameRandom {
            self.refresh_order()?;
        }

        let mut batch = match self.config.visit_policy {
            VisitPolicy::FrameRandom => self.select_frame_random()?,
            VisitPolicy::Original | VisitPolicy::UtteranceRandom => {
                self.select_utterance(max_utterances)?
            }
            VisitPolicy::ParallelOriginal | VisitPolicy::ParallelRandom => {
                self.select_parallel()?
            }
        };
        batch.utterance_end = batch
            .frames
            .iter()
            .map(|f| f.frame + 1 == self.utterances[f.utterance].frame_count)
            .collect();
        batch.index = self.stats.batches;
        if batch.frames.is_empty() && !batch.is_final {
            return Err(HnnError::CacheExhausted(format!(
                "no frame could be selected with {} of {} utterances claimed and {} frames resident",
                self.order_ptr,
                self.utterances.len(),
                self.resident_frames
            )));
        }

        self.stats.batches += 1;
        self.stats.frames += batch.frames.len();
        self.pending = batch.frames.clone();
        self.finished = batch.is_final;
        Ok(batch)
    }

    fn select_frame_random(&mut self) -> HnnResult<CacheBatch> {
        let mut batch = CacheBatch::default();
        while batch.frames.len() < self.config.batch_size {
            if self.frame_ptr == self.frame_order.len() {
                if !self.refresh_order()? {
                    break;
                }
                self.rebuild_frame_order()?;
                continue;
            }
            let frame = self.frame_order[self.frame_ptr];
            self.frame_ptr += 1;
            batch.frames.push(frame);
            batch.commands.push(StreamCommand::Continue);
        }
        batch.is_final = self.next_unloaded == self.utterances.len()
            && self.order_end == self.utterances.len()
            && self.frame_ptr == self.frame_order.len();
        Ok(batch)
    }

    fn select_utterance(&mut self, max_utterances: Option<usize>) -> HnnResult<CacheBatch> {
        let mut batch = CacheBatch::default();
        let mut ended = 0;
        if self.pointers[0].is_none() {
            self.advance(0)?;
        }
        while batch.frames.len() < self.config.batch_size {
            let Some(p) = self.pointers[0] else { break };
            batch.frames.push(p);
            batch.commands.push(if p.frame == 0 {
                StreamCommand::Reset
            } else {
                StreamCommand::Continue
            });
            let last = p.frame + 1 == self.utterances[p.utterance].frame_count;
            self.advance(0)?;
            if last {
                ended += 1;
                if max_utterances.is_some_and(|limit| ended >= limit) {
                    break;
                }
            }
        }
        batch.is_final = self.pointers[0].is_none() && self.all_claimed();
        Ok(batch)
    }

    fn select_parallel(&mut self) -> HnnResult<CacheBatch> {
        let slots = self.pointers.len();
        let mut batch = CacheBatch {
            commands: vec![StreamCommand::Idle; slots],
            ..CacheBatch::default()
        };

        // claim utterances for empty slots and pack active streams to the front
        let mut active = 0;
        for slot in 0..slots {
            if self.pointers[slot].is_none() {
                self.advance(slot)?;
            }
            let Some(p) = self.pointers[slot] else {
                continue;
            };
            batch.commands[active] = if p.frame == 0 {
                StreamCommand::Reset
            } else if slot != active {
                StreamCommand::MoveFrom(slot)
            } else {
                StreamCommand::Continue
            };
            if slot != active {
                self.pointers[active] = Some(p);
                self.pointers[slot] = None;
            }
            active += 1;
        }

        for slot in 0..active {
            if let Some(p) = self.pointers[slot] {
                batch.frames.push(p);
                self.advance(slot)?;
            }
        }
        batch.is_final = self.pointers.iter().all(|p| p.is_none()) && self.all_claimed();
        Ok(batch)
    }

    /// Count the frames of the last batch as consumed and evict finished
    /// utterances. Called automatically before each new batch.
    pub fn release_batch(&mut self) -> HnnResult<()> {
        for frame in std::mem::take(&mut self.pending) {
            let utt = &mut self.utterances[frame.utterance];
            utt.frames_used += 1;
            if utt.frames_used > utt.frame_count {
                return Err(HnnError::Internal(format!(
                    "utterance '{}' used {} of {} frames",
                    utt.name, utt.frames_used, utt.frame_count
                )));
            }
            if utt.frames_used == utt.frame_count {
                utt.release();
                self.resident_frames -= utt.frame_count;
                self.stats.released += 1;
                debug!("released '{}' ({} resident)", utt.name, self.resident_frames);
            }
        }
        Ok(())
    }

    /// Rewind to the start of the manifest for a new epoch.
    pub fn reset(&mut self) {
        for utt in &mut self.utterances {
            utt.clear();
        }
        self.next_unloaded = 0;
        self.order.clear();
        self.order_start = 0;
        self.order_end = 0;
        self.order_ptr = 0;
        self.frame_order.clear();
        self.frame_ptr = 0;
        self.pointers.clear();
        self.pending.clear();
        self.resident_frames = 0;
        self.initialized = false;
        self.finished = false;
        self.epoch = self.epoch.wrapping_add(1);
        debug!("cache rewound, epoch {}", self.epoch);
    }

    // -- speaker parameters -------------------------------------------------

    /// Install the overrides prepared for utterance `idx`.
    pub fn install_speaker(&mut self, graph: &mut FeatureGraph, idx: usize) -> HnnResult<usize> {
        let Some(swap) = self.speakers.as_mut() else {
            return Ok(0);
        };
        let utt = self
            .utterances
            .get(idx)
            .ok_or_else(|| HnnError::Internal(format!("utterance index {idx} out of range")))?;
        swap.install(graph, &utt.overrides)
    }

    /// Reinstall the session-independent parameters.
    pub fn restore_speakers(&mut self, graph: &mut FeatureGraph) -> HnnResult<usize> {
        match self.speakers.as_mut() {
            Some(swap) => swap.restore(graph),
            None => Ok(0),
        }
    }
}
