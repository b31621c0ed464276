//! Конвейер подачи батчей.
//!
//! Граф строится и аннотируется один раз при загрузке, затем каждый вызов
//! [`FeedPipeline::next_batch`] вытесняет отработанные высказывания,
//! выбирает кадры, при необходимости подменяет параметры диктора и
//! заполняет входы графа.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hnn_batch::BatchAssembler;
use hnn_cache::{Manifest, StreamingCache};
use hnn_core::{
    CacheConfig, GraphConfig, HnnError, HnnResult, LabelSource, ObservationReader,
    SpeakerSwapConfig, StreamCommand,
};
use hnn_graph::{FeatureGraph, LayerId, propagate_context};
use hnn_speaker::SpeakerParameterSwap;

// ---------------------------------------------------------------------------
// Конфигурация
// ---------------------------------------------------------------------------

/// Полная конфигурация конвейера (JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Индекс входного потока, читаемого кешем.
    pub stream: usize,

    /// Параметры кеша.
    pub cache: CacheConfig,

    /// Параметры построения графа.
    pub graph: GraphConfig,

    /// Подменяемые по диктору связки.
    pub speakers: SpeakerSwapConfig,
}

impl PipelineConfig {
    /// Загрузить конфигурацию из JSON-файла.
    pub fn from_json_file(path: impl AsRef<Path>) -> HnnResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Проверить согласованность параметров.
    pub fn validate(&self) -> HnnResult<()> {
        self.cache.validate()?;
        if !self.speakers.is_empty() && !self.cache.visit_policy.is_utterance_level() {
            return Err(HnnError::Config(format!(
                "speaker parameter swaps need an utterance-level visit policy, got {}",
                self.cache.visit_policy
            )));
        }
        Ok(())
    }
}

/// Открыть кеш по манифесту с параметрами из `config`.
pub fn open_cache(
    manifest: Manifest,
    reader: Box<dyn ObservationReader>,
    labels: Option<Box<dyn LabelSource>>,
    config: &PipelineConfig,
) -> HnnResult<StreamingCache> {
    config.validate()?;
    StreamingCache::open(manifest, reader, labels, config.stream, config.cache.clone())
}

// ---------------------------------------------------------------------------
// Батч
// ---------------------------------------------------------------------------

/// Сводка о выданном батче.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInfo {
    /// Номер батча.
    pub index: u64,

    /// Число кадров в батче.
    pub frame_count: usize,

    /// Последний батч эпохи.
    pub is_final: bool,

    /// Флаги конца высказывания по кадрам.
    pub utterance_end: Vec<bool>,

    /// Команды потокам (для параллельных политик по одной на слот).
    pub commands: Vec<StreamCommand>,
}

// ---------------------------------------------------------------------------
// Конвейер
// ---------------------------------------------------------------------------

/// Кеш заполняет только один поток: смеси с элементами других потоков
/// никогда не были бы собраны.
fn check_single_stream(graph: &FeatureGraph, stream: usize) -> HnnResult<()> {
    for id in graph.mix_ids() {
        let Some(mix) = graph.mix(id) else { continue };
        let foreign = mix
            .elems
            .iter()
            .filter_map(|e| graph.elem(*e).and_then(|e| e.cache_stream()))
            .find(|s| *s != stream);
        if let Some(other) = foreign {
            return Err(HnnError::Graph(format!(
                "mixture '{}' reads stream {other}, but the cache fills stream {stream}",
                mix.name
            )));
        }
    }
    Ok(())
}

/// Граф признаков, кеш и сборщик батчей в одном объекте.
pub struct FeedPipeline {
    graph: FeatureGraph,
    cache: StreamingCache,
    assembler: BatchAssembler,
    speakers: bool,
    current_utterance: Option<usize>,
}

impl FeedPipeline {
    /// Собрать конвейер; контексты графа пересчитываются здесь.
    pub fn new(mut graph: FeatureGraph, cache: StreamingCache) -> HnnResult<Self> {
        let order = propagate_context(&mut graph)?;
        let stream = cache.stream();
        if graph.input_elems(stream).is_empty() {
            return Err(HnnError::Config(format!(
                "graph has no feature element reading stream {stream}"
            )));
        }
        check_single_stream(&graph, stream)?;
        let speakers = cache.speaker_swap().is_some_and(|s| !s.is_empty());
        if speakers && !cache.config().visit_policy.is_utterance_level() {
            return Err(HnnError::Config(format!(
                "speaker parameter swaps need an utterance-level visit policy, got {}",
                cache.config().visit_policy
            )));
        }

        info!(
            "FeedPipeline: {} слоёв, поток {}, политика {}, подмена дикторов: {}",
            order.len(),
            stream,
            cache.config().visit_policy,
            if speakers { "да" } else { "нет" }
        );

        Ok(Self {
            graph,
            cache,
            assembler: BatchAssembler::new(stream),
            speakers,
            current_utterance: None,
        })
    }

    /// Собрать конвейер с подменой параметров дикторов из `config`.
    pub fn with_speakers(
        graph: FeatureGraph,
        cache: StreamingCache,
        config: &SpeakerSwapConfig,
    ) -> HnnResult<Self> {
        if config.is_empty() {
            return Self::new(graph, cache);
        }
        let swap = SpeakerParameterSwap::from_config(config, &graph)?;
        Self::new(graph, cache.with_speaker_swap(swap))
    }

    pub fn graph(&self) -> &FeatureGraph {
        &self.graph
    }

    /// Граф для записи выходов слоёв и градиентов.
    pub fn graph_mut(&mut self) -> &mut FeatureGraph {
        &mut self.graph
    }

    pub fn cache(&self) -> &StreamingCache {
        &self.cache
    }

    pub fn assembler(&self) -> &BatchAssembler {
        &self.assembler
    }

    /// Высказывание, параметры диктора которого сейчас установлены.
    pub fn current_utterance(&self) -> Option<usize> {
        self.current_utterance
    }

    /// Выдать следующий батч и заполнить им входы графа.
    pub fn next_batch(&mut self) -> HnnResult<BatchInfo> {
        let batch = if self.speakers {
            // батч не должен пересекать границу высказываний
            self.cache.next_batch_within(Some(1))?
        } else {
            self.cache.next_batch()?
        };

        if self.speakers {
            if let Some(first) = batch.frames.first() {
                if self.current_utterance != Some(first.utterance) {
                    let swapped = self.cache.install_speaker(&mut self.graph, first.utterance)?;
                    if swapped > 0 {
                        debug!(
                            "installed {} speaker bundles for utterance {}",
                            swapped,
                            first.utterance
                        );
                    }
                    self.current_utterance = Some(first.utterance);
                }
            }
        }

        let frame_count = self.assembler.assemble(&mut self.graph, &self.cache, &batch)?;
        Ok(BatchInfo {
            index: batch.index,
            frame_count,
            is_final: batch.is_final,
            utterance_end: batch.utterance_end,
            commands: batch.commands,
        })
    }

    /// Заполнить вход слоя `layer` из выходов его источников.
    pub fn fill_mix(&mut self, layer: LayerId) -> HnnResult<bool> {
        self.assembler.fill_mix(&mut self.graph, layer)
    }

    /// Накопить ошибку слоя `layer` по градиентам потребителей.
    pub fn accumulate_errors(&mut self, layer: LayerId) -> HnnResult<bool> {
        hnn_batch::accumulate_errors(&mut self.graph, layer)
    }

    /// Вернуться к началу манифеста и восстановить исходные параметры.
    pub fn reset(&mut self) -> HnnResult<()> {
        let restored = self.cache.restore_speakers(&mut self.graph)?;
        self.cache.reset();
        self.current_utterance = None;
        info!(
            "FeedPipeline: сброс, эпоха {}, восстановлено связок: {}",
            self.cache.epoch(),
            restored
        );
        Ok(())
    }

    /// Разобрать конвейер на граф и кеш.
    pub fn into_parts(self) -> (FeatureGraph, StreamingCache) {
        (self.graph, self.cache)
    }
}
