//! # hnn-core
//!
//! Базовые типы, трейты и определения ошибок для RustHNN.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Общие типы данных (`FrameMatrix`, `FrameIndex`, `UtteranceLabels`)
//! - Конфигурационные структуры кеша, графа и подмены параметров
//! - Декларации модели ([`Declaration`]) и их поставщик
//! - Унифицированная обработка ошибок через `HnnError`
//! - Трейты внешних интерфейсов ([`ObservationReader`], [`LabelSource`])

pub mod config;
pub mod description;
pub mod error;
pub mod labels;
pub mod traits;
pub mod types;

pub use config::{
    CacheConfig, GraphConfig, ReplaceableEntryConfig, ShufflePolicy, SpeakerSwapConfig,
    VisitPolicy,
};
pub use description::{
    ActivationKind, BundleDecl, BundleKind, Declaration, ElemDecl, LayerDecl, LayerKind,
    MixtureDecl, ModelDescription, NetworkDecl, OutputDecl, SourceDecl,
};
pub use error::{HnnError, HnnResult};
pub use labels::targets_from_segments;
pub use traits::{
    LabelSource, ModelDescriptionProvider, ObservationReader, ParameterStore,
    SpeakerPatternMatcher,
};
pub use types::{
    FrameIndex, FrameMatrix, LabelKind, LabelSegment, LatticeHandle, Observation, StreamCommand,
    UtteranceLabels,
};
