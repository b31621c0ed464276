//! Внешние интерфейсы: чтение наблюдений, меток, описания модели и
//! параметров дикторов.
//!
//! Форматы файлов остаются за реализациями этих трейтов; кеш и граф
//! работают только через них.

use candle_core::Tensor;

use crate::description::Declaration;
use crate::error::HnnResult;
use crate::types::{LabelKind, Observation, UtteranceLabels};

/// Источник кадров наблюдений.
pub trait ObservationReader: Send {
    /// Прочитать высказывание `name` для потока `stream`.
    ///
    /// # Ошибки
    /// Возвращает `HnnError`, если файл не найден, повреждён или поток
    /// не поддерживается.
    fn read(&mut self, name: &str, stream: usize) -> HnnResult<Observation>;
}

/// Источник меток обучения.
pub trait LabelSource: Send {
    /// Вид поставляемых меток.
    fn kind(&self) -> LabelKind;

    /// Метки высказывания длиной `frame_count` кадров.
    fn load(&mut self, name: &str, frame_count: usize) -> HnnResult<UtteranceLabels>;
}

/// Поставщик деклараций модели в порядке зависимостей.
pub trait ModelDescriptionProvider {
    /// Следующая декларация или `None` в конце описания.
    fn next_declaration(&mut self) -> HnnResult<Option<Declaration>>;
}

/// Извлечение идентификатора диктора из имени высказывания.
pub trait SpeakerPatternMatcher: Send {
    /// `None`, если шаблон не подходит к имени.
    fn extract(&self, pattern: &str, utterance: &str) -> Option<String>;
}

/// Хранилище параметров, подменяемых по диктору.
pub trait ParameterStore: Send {
    /// Значения связки `bundle` для диктора `speaker`; `None`, если их нет.
    fn load(&mut self, speaker: &str, bundle: &str) -> HnnResult<Option<Tensor>>;
}
