//! Tensor bundles: a trainable tensor plus its optimizer companions.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use hnn_core::{BundleDecl, BundleKind, HnnError, HnnResult};

/// Optimizer state stored next to the primary values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Companion {
    Gradient,
    Update,
    NegLearningRate,
    SumSquaredGrad,
}

impl Companion {
    pub fn all() -> &'static [Companion] {
        &[
            Companion::Gradient,
            Companion::Update,
            Companion::NegLearningRate,
            Companion::SumSquaredGrad,
        ]
    }

    fn slot(self) -> usize {
        match self {
            Companion::Gradient => 0,
            Companion::Update => 1,
            Companion::NegLearningRate => 2,
            Companion::SumSquaredGrad => 3,
        }
    }
}

impl fmt::Display for Companion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Companion::Gradient => "gradient",
            Companion::Update => "update",
            Companion::NegLearningRate => "neg-learning-rate",
            Companion::SumSquaredGrad => "sum-squared-grad",
        };
        f.write_str(name)
    }
}

/// Primary tensor with optional companions of identical shape.
///
/// The use-count is kept by the arena that owns the bundle.
#[derive(Debug, Clone)]
pub struct TensorBundle {
    name: String,
    kind: BundleKind,
    values: Tensor,
    companions: [Option<Tensor>; 4],
    update_enabled: bool,
}

impl TensorBundle {
    pub fn new(name: impl Into<String>, kind: BundleKind, values: Tensor) -> Self {
        Self {
            name: name.into(),
            kind,
            values,
            companions: [None, None, None, None],
            update_enabled: true,
        }
    }

    /// Zero-filled matrix bundle `rows × cols`.
    pub fn zeros_matrix(name: impl Into<String>, rows: usize, cols: usize) -> HnnResult<Self> {
        let values = Tensor::zeros((rows, cols), DType::F32, &Device::Cpu)?;
        Ok(Self::new(name, BundleKind::SessionIndependent, values))
    }

    /// Zero-filled vector bundle of length `len`.
    pub fn zeros_vector(name: impl Into<String>, len: usize) -> HnnResult<Self> {
        let values = Tensor::zeros(len, DType::F32, &Device::Cpu)?;
        Ok(Self::new(name, BundleKind::SessionIndependent, values))
    }

    /// Build a bundle from its declaration.
    pub fn from_decl(decl: &BundleDecl, device: &Device) -> HnnResult<Self> {
        if decl.shape.is_empty() || decl.shape.len() > 2 || decl.shape.contains(&0) {
            return Err(HnnError::Graph(format!(
                "bundle '{}' has unsupported shape {:?}",
                decl.name, decl.shape
            )));
        }
        let count: usize = decl.shape.iter().product();
        let data = match &decl.values {
            Some(v) if v.len() == count => v.clone(),
            Some(v) => {
                return Err(HnnError::DimensionMismatch(format!(
                    "bundle '{}' declares shape {:?} but carries {} values",
                    decl.name,
                    decl.shape,
                    v.len()
                )));
            }
            None => vec![decl.fill; count],
        };
        let values = Tensor::from_vec(data, decl.shape.as_slice(), device)?;
        let mut bundle = Self::new(decl.name.clone(), decl.kind, values);
        bundle.update_enabled = decl.update;
        Ok(bundle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BundleKind {
        self.kind
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn dims(&self) -> &[usize] {
        self.values.dims()
    }

    pub fn update_enabled(&self) -> bool {
        self.update_enabled
    }

    pub fn set_update_enabled(&mut self, enabled: bool) {
        self.update_enabled = enabled;
    }

    pub fn companion(&self, which: Companion) -> Option<&Tensor> {
        self.companions[which.slot()].as_ref()
    }

    /// Companions currently present.
    pub fn present_companions(&self) -> Vec<Companion> {
        Companion::all()
            .iter()
            .copied()
            .filter(|c| self.companion(*c).is_some())
            .collect()
    }

    fn check_shape(&self, what: &str, tensor: &Tensor) -> HnnResult<()> {
        if tensor.dims() != self.values.dims() {
            return Err(HnnError::DimensionMismatch(format!(
                "{what} of bundle '{}' has shape {:?}, expected {:?}",
                self.name,
                tensor.dims(),
                self.values.dims()
            )));
        }
        Ok(())
    }

    /// Replace the primary values; the shape must not change.
    pub fn replace_values(&mut self, values: Tensor) -> HnnResult<()> {
        self.check_shape("values", &values)?;
        self.values = values;
        Ok(())
    }

    pub fn set_companion(&mut self, which: Companion, tensor: Tensor) -> HnnResult<()> {
        self.check_shape(&which.to_string(), &tensor)?;
        self.companions[which.slot()] = Some(tensor);
        Ok(())
    }

    pub fn clear_companion(&mut self, which: Companion) {
        self.companions[which.slot()] = None;
    }

    /// Allocate a zeroed companion if it is missing.
    pub fn ensure_companion(&mut self, which: Companion) -> HnnResult<&Tensor> {
        let slot = which.slot();
        if self.companions[slot].is_none() {
            self.companions[slot] = Some(self.values.zeros_like()?);
        }
        self.companions[slot]
            .as_ref()
            .ok_or_else(|| HnnError::Internal(format!("companion {which} vanished")))
    }

    /// Copy values and companions from `other`, keeping this bundle's name and kind.
    pub fn install_from(&mut self, other: &TensorBundle) -> HnnResult<()> {
        self.check_shape("installed values", &other.values)?;
        self.values = other.values.clone();
        self.companions = other.companions.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_companion_shape_must_match() {
        let mut bundle = TensorBundle::zeros_matrix("W", 3, 2).expect("bundle");
        let wrong = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).expect("tensor");
        let err = bundle.set_companion(Companion::Gradient, wrong).unwrap_err();
        assert!(matches!(err, HnnError::DimensionMismatch(_)));
        assert!(bundle.companion(Companion::Gradient).is_none());

        let grad = bundle.ensure_companion(Companion::Gradient).expect("grad");
        assert_eq!(grad.dims(), &[3, 2]);
        assert_eq!(bundle.present_companions(), vec![Companion::Gradient]);
    }

    #[test]
    fn test_from_decl_checks_value_count() {
        let decl = BundleDecl {
            name: "b".into(),
            shape: vec![4],
            kind: BundleKind::SessionIndependent,
            values: Some(vec![1.0, 2.0, 3.0]),
            fill: 0.0,
            update: true,
        };
        assert!(TensorBundle::from_decl(&decl, &Device::Cpu).is_err());

        let decl = BundleDecl {
            values: None,
            fill: 0.5,
            ..decl
        };
        let bundle = TensorBundle::from_decl(&decl, &Device::Cpu).expect("bundle");
        let values = bundle.values().to_vec1::<f32>().expect("values");
        assert_eq!(values, vec![0.5; 4]);
    }

    #[test]
    fn test_replace_values_keeps_shape() {
        let mut bundle = TensorBundle::zeros_vector("b", 3).expect("bundle");
        let ok = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).expect("tensor");
        bundle.replace_values(ok).expect("replace");
        let bad = Tensor::new(&[1f32, 2.], &Device::Cpu).expect("tensor");
        assert!(bundle.replace_values(bad).is_err());
    }
}
