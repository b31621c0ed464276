//! Типы ошибок RustHNN.

use thiserror::Error;

/// Основной тип ошибок построения графа и подачи данных.
#[derive(Error, Debug)]
pub enum HnnError {
    /// Объявленные размерности не совпадают (смесь и вход слоя, форма связки, метки).
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Элемент ссылается на выход слоя, который так и не был объявлен.
    #[error("Unresolved source: feature element refers to unknown layer '{0}'")]
    UnresolvedSource(String),

    /// Граф зависимостей слоёв содержит цикл.
    #[error("Unsupported cycle through layer '{0}'")]
    UnsupportedCycle(String),

    /// Сегменты меток не покрывают кадры высказывания без разрывов.
    #[error("Discontinuous utterance '{utterance}': {detail}")]
    DiscontinuousUtterance { utterance: String, detail: String },

    /// Указатель кадров не смог получить следующее высказывание до конца эпохи.
    #[error("Cache exhausted: {0}")]
    CacheExhausted(String),

    /// Маска диктора не подходит к имени высказывания.
    #[error("Speaker pattern '{pattern}' does not match utterance '{utterance}'")]
    SpeakerPatternMismatch { pattern: String, utterance: String },

    /// Сбой загрузки записи манифеста в кеш.
    #[error("Failed to load utterance '{name}' (manifest entry {position}): {source}")]
    UtteranceLoad {
        name: String,
        position: usize,
        #[source]
        source: Box<HnnError>,
    },

    /// Недопустимые значения наблюдений (NaN, бесконечность).
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Некорректные декларации (повтор имён, общий слой, неверный контекст).
    #[error("Graph error: {0}")]
    Graph(String),

    /// Ошибки конфигурации.
    #[error("Config error: {0}")]
    Config(String),

    /// Нарушен внутренний инвариант, например счётчик использований ушёл ниже нуля.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Ошибки ввода-вывода.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Ошибки тензоров Candle.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Ошибки разбора JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HnnError {
    /// Дополнить ошибку загрузки позицией в манифесте.
    pub fn at_utterance(self, name: &str, position: usize) -> Self {
        HnnError::UtteranceLoad {
            name: name.to_string(),
            position,
            source: Box::new(self),
        }
    }
}

/// Псевдоним результата операций RustHNN.
pub type HnnResult<T> = Result<T, HnnError>;
