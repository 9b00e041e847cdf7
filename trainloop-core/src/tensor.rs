//! Dense tensor used at the runner's numeric boundaries.
//!
//! Storage is always an `f32` [`ndarray`] array; the [`DType`] tag records the working precision and
//! values are rounded to it whenever a tensor is cast. Serialized tensors carry
//! their raw little-endian bytes so a save/load cycle is bit-exact.

use crate::device::Device;
use crate::error::{Result, RunnerError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ndarray::{
    Array, Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Dimension, Ix1, Ix2, IxDyn, Slice,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Working precision of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
    BF16,
}

const F16_MAX: f32 = 65504.0;

impl DType {
    pub fn bytes_per_element(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    pub fn is_reduced(&self) -> bool {
        !matches!(self, DType::F32)
    }

    /// Round an `f32` to the nearest value representable in this precision.
    ///
    /// F16 overflows to infinity past its finite range; BF16 keeps the FP32 exponent.
    pub fn round(&self, x: f32) -> f32 {
        match self {
            DType::F32 => x,
            DType::F16 => {
                let r = round_mantissa(x, 10);
                if r.is_finite() && r.abs() > F16_MAX {
                    f32::INFINITY.copysign(r)
                } else {
                    r
                }
            }
            DType::BF16 => round_mantissa(x, 7),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        };
        f.write_str(name)
    }
}

/// Round-half-to-even on the f32 mantissa, keeping `keep` explicit bits.
fn round_mantissa(x: f32, keep: u32) -> f32 {
    if !x.is_finite() {
        return x;
    }
    let shift = 23 - keep;
    let bits = x.to_bits();
    let lsb = (bits >> shift) & 1;
    let bias = (1u32 << (shift - 1)) - 1 + lsb;
    let rounded = bits.wrapping_add(bias) & !((1u32 << shift) - 1);
    f32::from_bits(rounded)
}

/// Dense tensor of rank 1 or 2 backed by an [`ndarray`] array.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
    dtype: DType,
    device: Device,
}

impl Tensor {
    /// Build a tensor from row-major values, checking that `data` fills `shape`.
    pub fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| {
            RunnerError::tensor(format!(
                "cannot build tensor of shape {shape:?} from {len} values: {e}"
            ))
        })?;
        Self::from_array(array)
    }

    /// Wrap an array of rank 1 or 2.
    pub fn from_array<D: Dimension>(array: Array<f32, D>) -> Result<Self> {
        if array.ndim() == 0 || array.ndim() > 2 {
            return Err(RunnerError::tensor(format!(
                "tensors have rank 1 or 2, got shape {:?}",
                array.shape()
            )));
        }
        Ok(Self::wrap(array.into_dyn()))
    }

    pub fn matrix(array: Array2<f32>) -> Self {
        Self::wrap(array.into_dyn())
    }

    pub fn vector(array: Array1<f32>) -> Self {
        Self::wrap(array.into_dyn())
    }

    fn wrap(data: ArrayD<f32>) -> Self {
        Self {
            data,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::wrap(ArrayD::zeros(IxDyn(&shape)))
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self {
            data: ArrayD::zeros(other.data.raw_dim()),
            dtype: other.dtype,
            device: other.device,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn array(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn array_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    /// Rank-2 view, for linear algebra.
    pub fn as_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        self.data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| RunnerError::tensor(format!("expected a matrix, got shape {:?}", self.shape())))
    }

    pub fn as_vector(&self) -> Result<ArrayView1<'_, f32>> {
        self.data
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| RunnerError::tensor(format!("expected a vector, got shape {:?}", self.shape())))
    }

    /// Values in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Leading dimension; the batch size for batched tensors.
    pub fn rows(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// Trailing dimension (1 for rank-1 tensors).
    pub fn cols(&self) -> usize {
        if self.data.ndim() == 2 { self.data.len_of(Axis(1)) } else { 1 }
    }

    /// Move to `device`. Storage is host-resident; only the placement tag changes.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    /// Cast to `dtype`, rounding every element.
    pub fn to_dtype(mut self, dtype: DType) -> Self {
        self.cast_in_place(dtype);
        self
    }

    pub fn cast_in_place(&mut self, dtype: DType) {
        if dtype.is_reduced() {
            self.data.mapv_inplace(|v| dtype.round(v));
        }
        self.dtype = dtype;
    }

    /// Re-round the stored values to the tensor's own precision.
    pub fn requantize(&mut self) {
        let dtype = self.dtype;
        self.cast_in_place(dtype);
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.mapv(f),
            dtype: self.dtype,
            device: self.device,
        }
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|v| v * factor)
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        self.ensure_same_shape(other, "add")?;
        self.data += &other.data;
        Ok(())
    }

    /// Element-wise `self - other`.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.ensure_same_shape(other, "sub")?;
        Ok(Tensor {
            data: &self.data - &other.data,
            dtype: self.dtype,
            device: self.device,
        })
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&v| f64::from(v)).sum::<f64>() / self.data.len() as f64
    }

    /// Rows `start..end` of the leading dimension.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Tensor> {
        if start > end || end > self.rows() {
            return Err(RunnerError::tensor(format!(
                "row slice {start}..{end} out of bounds for {} rows",
                self.rows()
            )));
        }
        Ok(Tensor {
            data: self.data.slice_axis(Axis(0), Slice::from(start..end)).to_owned(),
            dtype: self.dtype,
            device: self.device,
        })
    }

    /// Bitwise equality, including dtype and shape. Distinguishes `-0.0` and NaN payloads.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.shape() == other.shape()
            && self.dtype == other.dtype
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    pub fn ensure_same_shape(&self, other: &Tensor, op: &str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(RunnerError::tensor(format!(
                "{op} shape mismatch: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct TensorRepr {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    data: String,
}

impl Serialize for Tensor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = self.data.iter().flat_map(|v| v.to_le_bytes()).collect();
        TensorRepr {
            shape: self.shape().to_vec(),
            dtype: self.dtype,
            device: self.device,
            data: STANDARD.encode(bytes),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;

        let repr = TensorRepr::deserialize(deserializer)?;
        let bytes = STANDARD.decode(repr.data).map_err(D::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(D::Error::custom("tensor payload is not a whole number of f32 values"));
        }
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut tensor = Tensor::from_vec(repr.shape, data).map_err(D::Error::custom)?;
        tensor.dtype = repr.dtype;
        tensor.device = repr.device;
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn t(shape: Vec<usize>, data: Vec<f32>) -> Tensor {
        Tensor::from_vec(shape, data).unwrap()
    }

    #[test]
    fn test_from_vec_rejects_bad_shape() {
        assert!(Tensor::from_vec(vec![2, 2], vec![1.0; 3]).is_err());
        assert!(Tensor::from_vec(vec![], vec![]).is_err());
        assert!(Tensor::from_vec(vec![1, 1, 1], vec![1.0]).is_err());
    }

    #[test]
    fn test_matrix_views() {
        let a = Tensor::matrix(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!((a.rows(), a.cols()), (2, 3));
        assert_eq!(a.as_matrix().unwrap().t().dot(&a.as_matrix().unwrap()).dim(), (3, 3));
        assert!(a.as_vector().is_err());

        let b = Tensor::vector(array![1.0, 2.0]);
        assert_eq!(b.cols(), 1);
        assert!(b.as_matrix().is_err());
    }

    #[test]
    fn test_slice_rows() {
        let a = t(vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let s = a.slice_rows(1, 3).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.to_vec(), vec![3.0, 4.0, 5.0, 6.0]);
        assert!(a.slice_rows(2, 4).is_err());
    }

    #[test]
    fn test_elementwise_shape_checks() {
        let mut a = t(vec![2], vec![1.0, 2.0]);
        a.add_assign(&t(vec![2], vec![0.5, 0.5])).unwrap();
        assert_eq!(a.to_vec(), vec![1.5, 2.5]);
        assert!(a.sub(&t(vec![1, 2], vec![1.0, 1.0])).is_err());
        assert_eq!(a.sub(&a).unwrap().to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_reduced_precision_rounding() {
        // 1 + 2^-12 is not representable in f16 (10 mantissa bits) and rounds to 1.
        let x = 1.0 + 2f32.powi(-12);
        assert_eq!(DType::F16.round(x), 1.0);
        assert_eq!(DType::F32.round(x), x);
        assert_eq!(DType::F16.round(70000.0), f32::INFINITY);
        assert_eq!(DType::BF16.round(70000.0), 70144.0);
        assert!(DType::F16.round(f32::NAN).is_nan());
    }

    #[test]
    fn test_cast_tags_dtype() {
        let a = t(vec![2], vec![0.1, 0.2]).to_dtype(DType::F16);
        assert_eq!(a.dtype(), DType::F16);
        assert_ne!(a.to_vec()[0], 0.1);
        assert!(a.all_finite());
    }

    #[test]
    fn test_serde_is_bit_exact() {
        let a = t(vec![1, 4], vec![0.1, -0.0, f32::MIN_POSITIVE, 1.0e-40])
            .to_device(Device::Cuda(1));
        let json = serde_json::to_string(&a).unwrap();
        let back: Tensor = serde_json::from_str(&json).unwrap();
        assert!(a.bit_eq(&back));
        assert_eq!(back.device(), Device::Cuda(1));
    }
}
