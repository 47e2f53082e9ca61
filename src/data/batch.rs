//! The batch container handed to the actor by the orchestration layer.
//!
//! A [`Batch`] is a set of named tensor fields plus named non-tensor fields
//! that all share a leading sample dimension, and a small bag of meta info
//! (e.g. the sampling temperature). Every operation that cuts or reorders
//! samples applies the same cut to every field so they stay aligned.

use std::collections::BTreeMap;

use ndarray::{
    concatenate, Array2, ArrayD, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix2, Ix3, Slice,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

use crate::error::LayoutError;

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Per-sample auxiliary inputs (e.g. vision features), keyed by input name.
/// Each array's first axis is concatenated across samples before the forward.
pub type AuxInputs = BTreeMap<String, Array2<f32>>;

/// A tensor field whose first axis is the sample dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorField {
    Int(ArrayD<i64>),
    Float(ArrayD<f32>),
    Bool(ArrayD<bool>),
}

impl TensorField {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Int(a) => a.shape(),
            Self::Float(a) => a.shape(),
            Self::Bool(a) => a.shape(),
        }
    }

    /// Size of the sample dimension (0 for scalars).
    pub fn leading_dim(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    fn slice_rows(&self, start: usize, end: usize) -> Self {
        let slice = Slice::from(start..end);
        match self {
            Self::Int(a) => Self::Int(a.slice_axis(Axis(0), slice).to_owned()),
            Self::Float(a) => Self::Float(a.slice_axis(Axis(0), slice).to_owned()),
            Self::Bool(a) => Self::Bool(a.slice_axis(Axis(0), slice).to_owned()),
        }
    }

    fn select_rows(&self, indices: &[usize]) -> Self {
        match self {
            Self::Int(a) => Self::Int(a.select(Axis(0), indices)),
            Self::Float(a) => Self::Float(a.select(Axis(0), indices)),
            Self::Bool(a) => Self::Bool(a.select(Axis(0), indices)),
        }
    }

    fn concat(name: &str, parts: &[&TensorField]) -> Result<Self, LayoutError> {
        let shape_err = |e: ndarray::ShapeError| {
            LayoutError::Invalid(format!("cannot concatenate field `{name}`: {e}"))
        };
        let type_err = |expected: &'static str, got: &TensorField| LayoutError::FieldType {
            field: name.to_string(),
            expected,
            got: got.type_name(),
        };

        match parts.first() {
            None => Err(LayoutError::Invalid(format!("no parts to concatenate for `{name}`"))),
            Some(Self::Int(_)) => {
                let views = parts
                    .iter()
                    .map(|p| match p {
                        Self::Int(a) => Ok(a.view()),
                        other => Err(type_err("int", other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Int(concatenate(Axis(0), &views).map_err(shape_err)?))
            }
            Some(Self::Float(_)) => {
                let views = parts
                    .iter()
                    .map(|p| match p {
                        Self::Float(a) => Ok(a.view()),
                        other => Err(type_err("float", other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Float(concatenate(Axis(0), &views).map_err(shape_err)?))
            }
            Some(Self::Bool(_)) => {
                let views = parts
                    .iter()
                    .map(|p| match p {
                        Self::Bool(a) => Ok(a.view()),
                        other => Err(type_err("bool", other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Bool(concatenate(Axis(0), &views).map_err(shape_err)?))
            }
        }
    }
}

impl From<Array2<i64>> for TensorField {
    fn from(a: Array2<i64>) -> Self {
        Self::Int(a.into_dyn())
    }
}

impl From<Array2<f32>> for TensorField {
    fn from(a: Array2<f32>) -> Self {
        Self::Float(a.into_dyn())
    }
}

impl From<Array2<bool>> for TensorField {
    fn from(a: Array2<bool>) -> Self {
        Self::Bool(a.into_dyn())
    }
}

impl From<ndarray::Array3<i64>> for TensorField {
    fn from(a: ndarray::Array3<i64>) -> Self {
        Self::Int(a.into_dyn())
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Named tensor and non-tensor fields sharing a leading sample dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    tensors: BTreeMap<String, TensorField>,
    non_tensors: BTreeMap<String, Vec<AuxInputs>>,
    meta_info: BTreeMap<String, Value>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples, or 0 for a batch without fields.
    pub fn len(&self) -> usize {
        self.tensors
            .values()
            .map(TensorField::leading_dim)
            .next()
            .or_else(|| self.non_tensors.values().map(Vec::len).next())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_leading_dim(&self, name: &str, got: usize) -> Result<(), LayoutError> {
        let has_fields = !self.tensors.is_empty() || !self.non_tensors.is_empty();
        if has_fields && got != self.len() {
            return Err(LayoutError::LeadingDim {
                field: name.to_string(),
                expected: self.len(),
                got,
            });
        }
        Ok(())
    }

    /// Insert or replace a tensor field. The leading dimension must match the
    /// fields already present.
    pub fn insert_tensor(
        &mut self,
        name: impl Into<String>,
        field: impl Into<TensorField>,
    ) -> Result<(), LayoutError> {
        let name = name.into();
        let field = field.into();
        if field.shape().is_empty() {
            return Err(LayoutError::Rank {
                what: name,
                expected: "at least 1".into(),
                got: 0,
            });
        }
        // Replacing the only field may change the batch size.
        let replacing_sole = self.tensors.len() == 1
            && self.non_tensors.is_empty()
            && self.tensors.contains_key(&name);
        if !replacing_sole {
            self.check_leading_dim(&name, field.leading_dim())?;
        }
        self.tensors.insert(name, field);
        Ok(())
    }

    /// Builder-style [`Batch::insert_tensor`].
    pub fn with_tensor(
        mut self,
        name: impl Into<String>,
        field: impl Into<TensorField>,
    ) -> Result<Self, LayoutError> {
        self.insert_tensor(name, field)?;
        Ok(self)
    }

    /// Insert or replace a per-sample non-tensor field.
    pub fn insert_non_tensor(
        &mut self,
        name: impl Into<String>,
        values: Vec<AuxInputs>,
    ) -> Result<(), LayoutError> {
        let name = name.into();
        self.check_leading_dim(&name, values.len())?;
        self.non_tensors.insert(name, values);
        Ok(())
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.meta_info.insert(key.into(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.meta_info.get(key)
    }

    /// Sampling temperature. Required: a missing temperature is an error
    /// rather than a silent default.
    pub fn temperature(&self) -> Result<f32, LayoutError> {
        let value = self
            .meta_info
            .get("temperature")
            .ok_or_else(|| LayoutError::MissingField("meta_info.temperature".into()))?;
        let t = value.as_f64().ok_or_else(|| {
            LayoutError::Invalid(format!("meta_info.temperature is not a number: {value}"))
        })? as f32;
        if !(t > 0.0) || !t.is_finite() {
            return Err(LayoutError::Invalid(format!(
                "temperature must be positive and finite, got {t}"
            )));
        }
        Ok(t)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn tensor(&self, name: &str) -> Result<&TensorField, LayoutError> {
        self.tensors
            .get(name)
            .ok_or_else(|| LayoutError::MissingField(name.to_string()))
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn non_tensor(&self, name: &str) -> Option<&[AuxInputs]> {
        self.non_tensors.get(name).map(Vec::as_slice)
    }

    pub fn int_dyn(&self, name: &str) -> Result<ArrayViewD<'_, i64>, LayoutError> {
        match self.tensor(name)? {
            TensorField::Int(a) => Ok(a.view()),
            other => Err(LayoutError::FieldType {
                field: name.to_string(),
                expected: "int",
                got: other.type_name(),
            }),
        }
    }

    pub fn int2(&self, name: &str) -> Result<ArrayView2<'_, i64>, LayoutError> {
        let view = self.int_dyn(name)?;
        let ndim = view.ndim();
        view.into_dimensionality::<Ix2>().map_err(|_| LayoutError::Rank {
            what: name.to_string(),
            expected: "2".into(),
            got: ndim,
        })
    }

    pub fn int3(&self, name: &str) -> Result<ArrayView3<'_, i64>, LayoutError> {
        let view = self.int_dyn(name)?;
        let ndim = view.ndim();
        view.into_dimensionality::<Ix3>().map_err(|_| LayoutError::Rank {
            what: name.to_string(),
            expected: "3".into(),
            got: ndim,
        })
    }

    pub fn float2(&self, name: &str) -> Result<ArrayView2<'_, f32>, LayoutError> {
        match self.tensor(name)? {
            TensorField::Float(a) => {
                let ndim = a.ndim();
                a.view()
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| LayoutError::Rank {
                        what: name.to_string(),
                        expected: "2".into(),
                        got: ndim,
                    })
            }
            other => Err(LayoutError::FieldType {
                field: name.to_string(),
                expected: "float",
                got: other.type_name(),
            }),
        }
    }

    /// A 2-D mask. Integer fields are accepted and read as `value != 0`.
    pub fn mask2(&self, name: &str) -> Result<Array2<bool>, LayoutError> {
        let field = self.tensor(name)?;
        let ndim = field.shape().len();
        let rank_err = |_| LayoutError::Rank {
            what: name.to_string(),
            expected: "2".into(),
            got: ndim,
        };
        match field {
            TensorField::Bool(a) => Ok(a.view().into_dimensionality::<Ix2>().map_err(rank_err)?.to_owned()),
            TensorField::Int(a) => Ok(a
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(rank_err)?
                .mapv(|v| v != 0)),
            other => Err(LayoutError::FieldType {
                field: name.to_string(),
                expected: "bool",
                got: other.type_name(),
            }),
        }
    }

    /// A reduced view holding only the named fields. Every tensor key must be
    /// present; absent non-tensor keys are skipped. Meta info is carried over.
    pub fn select(&self, tensor_keys: &[&str], non_tensor_keys: &[&str]) -> Result<Self, LayoutError> {
        let mut tensors = BTreeMap::new();
        for key in tensor_keys {
            tensors.insert(key.to_string(), self.tensor(key)?.clone());
        }
        let non_tensors = non_tensor_keys
            .iter()
            .filter_map(|key| {
                self.non_tensors
                    .get(*key)
                    .map(|v| (key.to_string(), v.clone()))
            })
            .collect();
        Ok(Self {
            tensors,
            non_tensors,
            meta_info: self.meta_info.clone(),
        })
    }

    /// Split into consecutive chunks of at most `size` samples.
    pub fn split(&self, size: usize) -> Result<Vec<Self>, LayoutError> {
        if size == 0 {
            return Err(LayoutError::Invalid("split size must be positive".into()));
        }
        let n = self.len();
        let mut chunks = Vec::with_capacity(n.div_ceil(size));
        let mut start = 0;
        while start < n {
            let end = (start + size).min(n);
            chunks.push(self.slice(start, end));
            start = end;
        }
        Ok(chunks)
    }

    fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(k, v)| (k.clone(), v.slice_rows(start, end)))
                .collect(),
            non_tensors: self
                .non_tensors
                .iter()
                .map(|(k, v)| (k.clone(), v[start..end].to_vec()))
                .collect(),
            meta_info: self.meta_info.clone(),
        }
    }

    /// Gather samples by index, in the given order.
    pub fn index_select(&self, indices: &[usize]) -> Result<Self, LayoutError> {
        let n = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
            return Err(LayoutError::Invalid(format!(
                "sample index {bad} out of range for batch of {n}"
            )));
        }
        Ok(Self {
            tensors: self
                .tensors
                .iter()
                .map(|(k, v)| (k.clone(), v.select_rows(indices)))
                .collect(),
            non_tensors: self
                .non_tensors
                .iter()
                .map(|(k, v)| (k.clone(), indices.iter().map(|&i| v[i].clone()).collect()))
                .collect(),
            meta_info: self.meta_info.clone(),
        })
    }

    /// Permute the samples with `rng`, keeping fields aligned.
    pub fn shuffle<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Self, LayoutError> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.index_select(&order)
    }

    /// Concatenate batches along the sample dimension. All parts must carry
    /// the same field names; meta info is taken from the first part.
    pub fn concat(parts: &[Self]) -> Result<Self, LayoutError> {
        let first = parts
            .first()
            .ok_or_else(|| LayoutError::Invalid("cannot concatenate zero batches".into()))?;

        let mut tensors = BTreeMap::new();
        for name in first.tensors.keys() {
            let fields = parts
                .iter()
                .map(|p| p.tensor(name))
                .collect::<Result<Vec<_>, _>>()?;
            tensors.insert(name.clone(), TensorField::concat(name, &fields)?);
        }

        let mut non_tensors = BTreeMap::new();
        for name in first.non_tensors.keys() {
            let mut joined = Vec::new();
            for part in parts {
                let values = part
                    .non_tensors
                    .get(name)
                    .ok_or_else(|| LayoutError::MissingField(name.clone()))?;
                joined.extend(values.iter().cloned());
            }
            non_tensors.insert(name.clone(), joined);
        }

        Ok(Self {
            tensors,
            non_tensors,
            meta_info: first.meta_info.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample_batch() -> Batch {
        let mut batch = Batch::new()
            .with_tensor("input_ids", array![[1i64, 2, 3], [4, 5, 6], [7, 8, 9], [10, 11, 12], [13, 14, 15]])
            .unwrap()
            .with_tensor(
                "advantages",
                array![[0.1f32, 0.2], [0.3, 0.4], [0.5, 0.6], [0.7, 0.8], [0.9, 1.0]],
            )
            .unwrap();
        let aux: Vec<AuxInputs> = (0..5)
            .map(|i| {
                let mut m = AuxInputs::new();
                m.insert("pixel_values".into(), Array2::from_elem((1, 2), i as f32));
                m
            })
            .collect();
        batch.insert_non_tensor("multi_modal_inputs", aux).unwrap();
        batch.set_meta("temperature", 0.7);
        batch
    }

    #[test]
    fn test_leading_dim_enforced() {
        let mut batch = sample_batch();
        let err = batch
            .insert_tensor("bad", array![[1i64], [2]])
            .unwrap_err();
        assert!(matches!(err, LayoutError::LeadingDim { expected: 5, got: 2, .. }));
        assert!(batch.insert_non_tensor("aux", vec![AuxInputs::new()]).is_err());
    }

    #[test]
    fn test_split_preserves_alignment() {
        let batch = sample_batch();
        let chunks = batch.split(2).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);

        let last = &chunks[2];
        assert_eq!(last.int2("input_ids").unwrap(), array![[13i64, 14, 15]]);
        assert_eq!(last.float2("advantages").unwrap(), array![[0.9f32, 1.0]]);
        let aux = last.non_tensor("multi_modal_inputs").unwrap();
        assert_eq!(aux[0]["pixel_values"][[0, 0]], 4.0);
        assert!((last.temperature().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_split_then_concat_is_identity() {
        let batch = sample_batch();
        let joined = Batch::concat(&batch.split(3).unwrap()).unwrap();
        assert_eq!(joined, batch);
    }

    #[test]
    fn test_split_zero_is_error() {
        assert!(sample_batch().split(0).is_err());
    }

    #[test]
    fn test_select_keeps_requested_fields() {
        let batch = sample_batch();
        let reduced = batch
            .select(&["input_ids"], &["multi_modal_inputs", "absent"])
            .unwrap();
        assert!(reduced.contains("input_ids"));
        assert!(!reduced.contains("advantages"));
        assert!(reduced.non_tensor("multi_modal_inputs").is_some());
        assert!(reduced.non_tensor("absent").is_none());
        assert!(batch.select(&["missing"], &[]).is_err());
    }

    #[test]
    fn test_shuffle_keeps_rows_together() {
        let batch = sample_batch();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let shuffled = batch.shuffle(&mut rng).unwrap();
        let ids = shuffled.int2("input_ids").unwrap();
        let adv = shuffled.float2("advantages").unwrap();
        let aux = shuffled.non_tensor("multi_modal_inputs").unwrap();
        for row in 0..5 {
            let original = ((ids[[row, 0]] - 1) / 3) as usize;
            assert!((adv[[row, 0]] - (0.1 + 0.2 * original as f32)).abs() < 1e-6);
            assert_eq!(aux[row]["pixel_values"][[0, 0]], original as f32);
        }
    }

    #[test]
    fn test_temperature_required() {
        let mut batch = Batch::new().with_tensor("x", array![[1i64]]).unwrap();
        assert!(matches!(batch.temperature(), Err(LayoutError::MissingField(_))));
        batch.set_meta("temperature", 0.0);
        assert!(batch.temperature().is_err());
        batch.set_meta("temperature", 1.0);
        assert_eq!(batch.temperature().unwrap(), 1.0);
    }

    #[test]
    fn test_mask_accepts_int_and_bool() {
        let batch = Batch::new()
            .with_tensor("int_mask", array![[0i64, 1, 1]])
            .unwrap()
            .with_tensor("bool_mask", array![[false, true, true]])
            .unwrap();
        assert_eq!(batch.mask2("int_mask").unwrap(), batch.mask2("bool_mask").unwrap());
    }
}
