//! Декларации модели: связки, элементы признаков, смеси, слои и сети.
//!
//! Источник деклараций (парсер макро-файлов или JSON) выдаёт их в порядке
//! зависимостей; исключение составляют ссылки элементов на ещё не
//! объявленные слои, они разрешаются после чтения всего описания.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HnnResult;
use crate::traits::ModelDescriptionProvider;

// ---------------------------------------------------------------------------
// Перечисления
// ---------------------------------------------------------------------------

/// Принадлежность связки тензоров сессии.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleKind {
    /// Общие параметры модели.
    #[default]
    SessionIndependent,
    /// Параметры, подменяемые по диктору/сессии.
    SessionDependent,
}

/// Функция активации слоя.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Affine,
    Linear,
    Relu,
    PRelu,
    Sigmoid,
    PSigmoid,
    SoftRelu,
    Softmax,
    Tanh,
}

impl ActivationKind {
    /// Число векторов параметров активации (каждый длиной в число узлов).
    pub fn parameter_count(&self) -> usize {
        match self {
            ActivationKind::Affine => 2,
            ActivationKind::PRelu | ActivationKind::PSigmoid => 1,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::Affine => "affine",
            ActivationKind::Linear => "linear",
            ActivationKind::Relu => "relu",
            ActivationKind::PRelu => "prelu",
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::PSigmoid => "psigmoid",
            ActivationKind::SoftRelu => "softrelu",
            ActivationKind::Softmax => "softmax",
            ActivationKind::Tanh => "tanh",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Тип слоя. Собирается только перцептрон.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    #[default]
    Perceptron,
    Convolution,
    Subsampling,
}

// ---------------------------------------------------------------------------
// Декларации
// ---------------------------------------------------------------------------

/// Связка тензоров.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDecl {
    pub name: String,

    /// Форма основного тензора: `[rows, cols]` для матрицы, `[len]` для вектора.
    pub shape: Vec<usize>,

    #[serde(default)]
    pub kind: BundleKind,

    /// Значения в построчном порядке; если нет, заполняется `fill`.
    #[serde(default)]
    pub values: Option<Vec<f32>>,

    #[serde(default)]
    pub fill: f32,

    #[serde(default = "default_true")]
    pub update: bool,
}

/// Источник элемента признаков.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDecl {
    /// Сырой поток наблюдений.
    Stream { index: usize },
    /// Выход слоя (может быть объявлен позже).
    Layer { name: String },
    /// Вспомогательный вектор высказывания потока `stream`.
    Auxiliary {
        #[serde(default)]
        stream: usize,
        index: usize,
    },
}

/// Элемент признаков: срез источника, развёрнутый по контексту.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElemDecl {
    pub source: SourceDecl,

    /// Полная ширина источника. Для слоя выводится из числа узлов.
    #[serde(default)]
    pub src_dim: Option<usize>,

    #[serde(default)]
    pub dim_offset: usize,

    pub width: usize,

    /// Строго возрастающие относительные смещения кадров.
    #[serde(default = "default_context")]
    pub context: Vec<i32>,

    /// Передавать ли ошибку обратно в слой-источник.
    #[serde(default = "default_true")]
    pub backprop: bool,
}

/// Смесь признаков: конкатенация элементов.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixtureDecl {
    pub name: String,
    pub elements: Vec<ElemDecl>,
}

/// Слой.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDecl {
    pub name: String,

    #[serde(default)]
    pub kind: LayerKind,

    pub input_dim: usize,

    pub node_count: usize,

    /// Имя связки весов `node_count × input_dim`.
    pub weights: String,

    /// Имя связки смещений длины `node_count`.
    pub bias: String,

    pub activation: ActivationKind,

    #[serde(default)]
    pub activation_params: Vec<String>,

    /// Имя входной смеси; без него вход синтезируется.
    #[serde(default)]
    pub input: Option<String>,

    #[serde(default, rename = "final")]
    pub is_final: bool,
}

/// Сеть: упорядоченный список слоёв.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDecl {
    pub name: String,
    pub layers: Vec<String>,
}

/// Выходной слой потока.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDecl {
    pub stream: usize,
    pub layer: String,
}

/// Одна декларация описания модели.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decl", rename_all = "snake_case")]
pub enum Declaration {
    Bundle(BundleDecl),
    Mixture(MixtureDecl),
    Layer(LayerDecl),
    Network(NetworkDecl),
    Output(OutputDecl),
}

impl Declaration {
    pub fn name(&self) -> &str {
        match self {
            Declaration::Bundle(d) => &d.name,
            Declaration::Mixture(d) => &d.name,
            Declaration::Layer(d) => &d.name,
            Declaration::Network(d) => &d.name,
            Declaration::Output(d) => &d.layer,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_context() -> Vec<i32> {
    vec![0]
}

// ---------------------------------------------------------------------------
// JSON-описание
// ---------------------------------------------------------------------------

/// Описание модели в JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDescription {
    pub declarations: Vec<Declaration>,
}

impl ModelDescription {
    pub fn new(declarations: Vec<Declaration>) -> Self {
        Self { declarations }
    }

    /// Загрузить описание из JSON-файла.
    pub fn from_json_file(path: impl AsRef<Path>) -> HnnResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Поставщик деклараций в порядке файла.
    pub fn into_provider(self) -> impl ModelDescriptionProvider {
        self.declarations.into_iter()
    }
}

impl ModelDescriptionProvider for std::vec::IntoIter<Declaration> {
    fn next_declaration(&mut self) -> HnnResult<Option<Declaration>> {
        Ok(self.next())
    }
}
