//! Конфигурационные структуры для графа признаков и потокового кеша.
//!
//! Все параметры передаются явно: в `build_graph`, `open_cache` и
//! конструктор конвейера. Глобального состояния нет.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{HnnError, HnnResult};

/// Потолок кеша в кадрах по умолчанию.
pub const DEFAULT_FRAME_CEILING: usize = 100_000;

/// Размер мини-батча по умолчанию.
pub const DEFAULT_BATCH_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Политика обхода
// ---------------------------------------------------------------------------

/// Порядок, в котором кеш выдаёт кадры.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitPolicy {
    /// Высказывания и кадры в порядке манифеста.
    Original,
    /// Высказывания перемешаны, кадры внутри высказывания по порядку.
    UtteranceRandom,
    /// Все кадры резидентных высказываний перемешаны.
    FrameRandom,
    /// Параллельные потоки (по одному на слот батча), порядок манифеста.
    ParallelOriginal,
    /// Параллельные потоки, высказывания перемешаны.
    ParallelRandom,
}

impl VisitPolicy {
    /// Все политики.
    pub fn all() -> &'static [VisitPolicy] {
        &[
            VisitPolicy::Original,
            VisitPolicy::UtteranceRandom,
            VisitPolicy::FrameRandom,
            VisitPolicy::ParallelOriginal,
            VisitPolicy::ParallelRandom,
        ]
    }

    /// Строковый идентификатор для CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitPolicy::Original => "original",
            VisitPolicy::UtteranceRandom => "utterance-random",
            VisitPolicy::FrameRandom => "frame-random",
            VisitPolicy::ParallelOriginal => "parallel-original",
            VisitPolicy::ParallelRandom => "parallel-random",
        }
    }

    /// Парсинг из строки, включая классические имена `DATAACCESSKIND`.
    pub fn from_str_loose(s: &str) -> Option<VisitPolicy> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "original" | "orig" => Some(VisitPolicy::Original),
            "utterance-random" | "utterancerand" | "uttrand" => Some(VisitPolicy::UtteranceRandom),
            "frame-random" | "framerand" | "frmrand" => Some(VisitPolicy::FrameRandom),
            "parallel-original" | "parallelstreamorigin" => Some(VisitPolicy::ParallelOriginal),
            "parallel-random" | "parallelstreamrand" => Some(VisitPolicy::ParallelRandom),
            _ => None,
        }
    }

    /// Политика с одним указателем на уровне высказываний.
    pub fn is_utterance_level(&self) -> bool {
        matches!(self, VisitPolicy::Original | VisitPolicy::UtteranceRandom)
    }

    /// Политика с параллельными потоками.
    pub fn is_parallel(&self) -> bool {
        matches!(
            self,
            VisitPolicy::ParallelOriginal | VisitPolicy::ParallelRandom
        )
    }

    /// Перемешивается ли порядок высказываний.
    pub fn shuffles_utterances(&self) -> bool {
        matches!(
            self,
            VisitPolicy::UtteranceRandom | VisitPolicy::FrameRandom | VisitPolicy::ParallelRandom
        )
    }
}

impl fmt::Display for VisitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Алгоритм перемешивания
// ---------------------------------------------------------------------------

/// Алгоритм перемешивания сегмента порядка.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShufflePolicy {
    /// Обмен с равномерно выбранным элементом на позиции не дальше текущей.
    RandomExchange,
    /// Обмен с равномерно выбранным элементом всего сегмента.
    FixedRangeExchange,
    /// Детерминированная перестановка регистром сдвига (LFSR).
    Lfsr,
}

impl ShufflePolicy {
    /// Строковый идентификатор для CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShufflePolicy::RandomExchange => "random-exchange",
            ShufflePolicy::FixedRangeExchange => "fixed-range-exchange",
            ShufflePolicy::Lfsr => "lfsr",
        }
    }

    /// Парсинг из строки, включая классические имена `SHUFFLEKIND`.
    pub fn from_str_loose(s: &str) -> Option<ShufflePolicy> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "random-exchange" | "knuthrand" | "knuth" => Some(ShufflePolicy::RandomExchange),
            "fixed-range-exchange" | "knuthfixed" => Some(ShufflePolicy::FixedRangeExchange),
            "lfsr" | "quicknet" => Some(ShufflePolicy::Lfsr),
            _ => None,
        }
    }
}

impl fmt::Display for ShufflePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Кеш
// ---------------------------------------------------------------------------

/// Конфигурация потокового кеша.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Потолок резидентных кадров: загрузка идёт, пока резидентных кадров меньше.
    pub frame_ceiling: usize,

    /// Число кадров в батче (и число потоков для параллельных политик).
    pub batch_size: usize,

    /// Политика обхода.
    pub visit_policy: VisitPolicy,

    /// Алгоритм перемешивания.
    pub shuffle_policy: ShufflePolicy,

    /// Зерно генератора.
    pub seed: u64,

    /// Прерывать эпоху при ошибке загрузки высказывания.
    pub strict: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            frame_ceiling: DEFAULT_FRAME_CEILING,
            batch_size: DEFAULT_BATCH_SIZE,
            visit_policy: VisitPolicy::FrameRandom,
            shuffle_policy: ShufflePolicy::RandomExchange,
            seed: 0,
            strict: true,
        }
    }
}

impl CacheConfig {
    /// Обучение на уровне кадров (перемешивание кадров).
    pub fn frame_level(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Последовательное обучение: высказывания целиком, по одному указателю.
    pub fn sequence_level(batch_size: usize) -> Self {
        Self {
            batch_size,
            visit_policy: VisitPolicy::UtteranceRandom,
            ..Self::default()
        }
    }

    /// Рекуррентное обучение: параллельные потоки.
    pub fn parallel_streams(streams: usize) -> Self {
        Self {
            batch_size: streams,
            visit_policy: VisitPolicy::ParallelRandom,
            ..Self::default()
        }
    }

    pub fn with_visit_policy(mut self, policy: VisitPolicy) -> Self {
        self.visit_policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_shuffle_policy(mut self, policy: ShufflePolicy) -> Self {
        self.shuffle_policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Зерно из текущего времени (аналог `RANDSEED = CURRENTTIME`).
    pub fn with_time_seed(mut self) -> Self {
        self.seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self
    }

    pub fn with_frame_ceiling(mut self, frames: usize) -> Self {
        self.frame_ceiling = frames;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Загрузить конфигурацию из JSON-файла.
    pub fn from_json_file(path: impl AsRef<Path>) -> HnnResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: CacheConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Проверить согласованность параметров.
    pub fn validate(&self) -> HnnResult<()> {
        if self.batch_size == 0 {
            return Err(HnnError::Config("batch_size must be positive".into()));
        }
        if self.frame_ceiling == 0 {
            return Err(HnnError::Config("frame_ceiling must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Граф
// ---------------------------------------------------------------------------

/// Конфигурация построения графа признаков.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Поток, из которого берутся неявные входы первого слоя сети.
    pub default_stream: usize,

    /// Разрешить синтез неявных входных смесей.
    pub implicit_inputs: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_stream: 0,
            implicit_inputs: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Подмена параметров диктора
// ---------------------------------------------------------------------------

/// Одна подменяемая по диктору связка тензоров.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceableEntryConfig {
    /// Имя связки в графе.
    pub bundle: String,

    /// Маска извлечения диктора из имени высказывания (`%` захватывает символ).
    pub mask: String,

    /// Каталог с файлами параметров дикторов.
    pub dir: PathBuf,

    /// Расширение файлов (`<dir>/<speaker>.<ext>`).
    #[serde(default = "default_parameter_ext")]
    pub ext: String,
}

fn default_parameter_ext() -> String {
    "safetensors".to_string()
}

/// Конфигурация подмены параметров по дикторам.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeakerSwapConfig {
    pub entries: Vec<ReplaceableEntryConfig>,
}

impl SpeakerSwapConfig {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_policy_classic_names() {
        assert_eq!(
            VisitPolicy::from_str_loose("FRAMERAND"),
            Some(VisitPolicy::FrameRandom)
        );
        assert_eq!(
            VisitPolicy::from_str_loose("PARALLELSTREAMORIGIN"),
            Some(VisitPolicy::ParallelOriginal)
        );
        assert_eq!(
            VisitPolicy::from_str_loose("utterance_random"),
            Some(VisitPolicy::UtteranceRandom)
        );
        assert_eq!(VisitPolicy::from_str_loose("sideways"), None);
        // иерархические обходы не поддерживаются
        assert_eq!(VisitPolicy::from_str_loose("HIERAND"), None);
        assert_eq!(VisitPolicy::from_str_loose("HIEPIPLRAND"), None);
        for policy in VisitPolicy::all() {
            assert_eq!(VisitPolicy::from_str_loose(policy.as_str()), Some(*policy));
        }
    }

    #[test]
    fn test_shuffle_policy_classic_names() {
        assert_eq!(
            ShufflePolicy::from_str_loose("QUICKNET"),
            Some(ShufflePolicy::Lfsr)
        );
        assert_eq!(
            ShufflePolicy::from_str_loose("KNUTHFIXED"),
            Some(ShufflePolicy::FixedRangeExchange)
        );
    }

    #[test]
    fn test_presets() {
        let config = CacheConfig::parallel_streams(8);
        assert_eq!(config.batch_size, 8);
        assert!(config.visit_policy.is_parallel());
        assert_eq!(config.frame_ceiling, DEFAULT_FRAME_CEILING);
        assert!(CacheConfig::sequence_level(16).visit_policy.is_utterance_level());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"batch_size": 32, "visit_policy": "parallel_random"}"#)
                .expect("parse config");
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.visit_policy, VisitPolicy::ParallelRandom);
        assert_eq!(config.frame_ceiling, DEFAULT_FRAME_CEILING);
        assert!(config.strict);
    }

    #[test]
    fn test_zero_batch_rejected() {
        let config = CacheConfig::frame_level(0);
        assert!(config.validate().is_err());
    }
}
