//! Общие типы для графа признаков и кеша.
//!
//! Матрицы кадров, индексы кадров, метки высказываний и команды потоков,
//! используемые всеми крейтами workspace.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{HnnError, HnnResult};

// ---------------------------------------------------------------------------
// Матрица кадров
// ---------------------------------------------------------------------------

/// Плотная матрица `rows × cols` кадров высказывания (по строке на кадр).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMatrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl FrameMatrix {
    /// Создать матрицу из плоского буфера.
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> HnnResult<Self> {
        if data.len() != rows * cols {
            return Err(HnnError::DimensionMismatch(format!(
                "frame buffer holds {} values, expected {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self { data, rows, cols })
    }

    /// Собрать матрицу из строк одинаковой ширины.
    pub fn from_rows(rows: &[Vec<f32>]) -> HnnResult<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(HnnError::DimensionMismatch(format!(
                    "row {i} has width {}, expected {cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            data,
            rows: rows.len(),
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Строка `idx`.
    pub fn row(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.cols..(idx + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Индекс первого нечислового значения (NaN или бесконечность).
    pub fn first_non_finite(&self) -> Option<(usize, usize)> {
        self.data
            .iter()
            .position(|v| !v.is_finite())
            .map(|pos| (pos / self.cols.max(1), pos % self.cols.max(1)))
    }
}

// ---------------------------------------------------------------------------
// Индексы кадров и команды потоков
// ---------------------------------------------------------------------------

/// Позиция кадра: высказывание (позиция в манифесте) и номер кадра в нём.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameIndex {
    pub utterance: usize,
    pub frame: usize,
}

impl FrameIndex {
    pub fn new(utterance: usize, frame: usize) -> Self {
        Self { utterance, frame }
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.utterance, self.frame)
    }
}

/// Команда для слота батча при потоковой подаче.
///
/// Нужна рекуррентным слоям, чтобы управлять историей каждого потока.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamCommand {
    /// Продолжение того же высказывания.
    Continue,
    /// Начало нового высказывания: история сбрасывается.
    Reset,
    /// Поток переехал из слота с указанным номером.
    MoveFrom(usize),
    /// Слот пуст.
    Idle,
}

// ---------------------------------------------------------------------------
// Метки
// ---------------------------------------------------------------------------

/// Вид меток, которые поставляет источник.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelKind {
    /// Индекс цели на кадр.
    Targets,
    /// Вектор признаков на кадр.
    Features,
    /// Пара решёток на высказывание.
    Lattices,
}

/// Непрозрачная решётка; алгоритмы над ней живут вне этого workspace.
#[derive(Clone)]
pub struct LatticeHandle(Arc<dyn Any + Send + Sync>);

impl LatticeHandle {
    pub fn new<T: Any + Send + Sync>(lattice: T) -> Self {
        Self(Arc::new(lattice))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for LatticeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LatticeHandle(..)")
    }
}

/// Метки одного высказывания.
#[derive(Debug, Clone, Default)]
pub enum UtteranceLabels {
    #[default]
    None,
    /// Индекс цели для каждого кадра.
    Targets(Vec<usize>),
    /// Вектор меток для каждого кадра.
    Features(FrameMatrix),
    /// Числитель и знаменатель для дискриминативного обучения.
    Lattices {
        numerator: Vec<LatticeHandle>,
        denominator: Vec<LatticeHandle>,
    },
}

impl UtteranceLabels {
    /// Число кадров, покрытых метками (решётки длины не задают).
    pub fn frame_count(&self) -> Option<usize> {
        match self {
            UtteranceLabels::None | UtteranceLabels::Lattices { .. } => None,
            UtteranceLabels::Targets(t) => Some(t.len()),
            UtteranceLabels::Features(m) => Some(m.rows()),
        }
    }
}

/// Отрезок меток `[start, end)` в кадрах.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSegment {
    pub start: usize,
    pub end: usize,
    pub target: usize,
}

// ---------------------------------------------------------------------------
// Наблюдения
// ---------------------------------------------------------------------------

/// Данные одного высказывания одного потока.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Кадры высказывания.
    pub frames: FrameMatrix,

    /// Именованные вспомогательные векторы (например, i-vector диктора).
    pub aux: Vec<Vec<f32>>,
}

impl Observation {
    pub fn new(frames: FrameMatrix) -> Self {
        Self {
            frames,
            aux: Vec::new(),
        }
    }

    pub fn with_aux(mut self, aux: Vec<Vec<f32>>) -> Self {
        self.aux = aux;
        self
    }

    pub fn frame_count(&self) -> usize {
        self.frames.rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_matrix_rows() {
        let m = FrameMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).expect("matrix");
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 2);
        assert_eq!(m.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_frame_matrix_rejects_ragged() {
        let err = FrameMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, HnnError::DimensionMismatch(_)));
        assert!(FrameMatrix::new(vec![0.0; 5], 2, 3).is_err());
    }

    #[test]
    fn test_non_finite_position() {
        let m = FrameMatrix::new(vec![0.0, 1.0, 2.0, f32::NAN, 4.0, 5.0], 3, 2).expect("matrix");
        assert_eq!(m.first_non_finite(), Some((1, 1)));
    }

    #[test]
    fn test_lattice_downcast() {
        let handle = LatticeHandle::new(42u32);
        assert_eq!(handle.downcast_ref::<u32>(), Some(&42));
        assert!(handle.downcast_ref::<String>().is_none());
    }
}
