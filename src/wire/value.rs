//! Host-side representation of values exchanged on the data channel.
//!
//! `RValue` mirrors the engine's native vector model: every exchanged value
//! is a vector of one element type, optionally shaped into a matrix.
//! Missing elements ("NA") are `None` host-side and are distinct from NaN,
//! which is `Some(f64::NAN)`.
//!
//! Scalar variants exist only as the result of singleton unwrapping on
//! `pull` and as conversion targets for ergonomic `assign` calls; on the
//! wire they travel as one-element vectors.

use crate::error::RBridgeError;

/// Wire type tags. Fixed for the lifetime of the protocol.
pub(crate) mod tag {
    pub const NOT_FOUND: i32 = -2;
    pub const UNKNOWN: i32 = -1;
    pub const LOGICAL: i32 = 0;
    pub const INTEGER: i32 = 1;
    pub const DOUBLE: i32 = 2;
    pub const CHARACTER: i32 = 3;
    pub const MATRIX: i32 = 4;
}

/// Reserved bit pattern for a missing 32-bit integer. A legitimate integer
/// with this value cannot travel as `Integer` and is promoted to `Double`
/// by the sender.
pub const NA_INTEGER: i32 = i32::MIN;

/// A typed value exchanged with the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RValue {
    /// Tri-state boolean vector.
    Logical(Vec<Option<bool>>),
    /// 32-bit integer vector; `None` is NA.
    Integer(Vec<Option<i32>>),
    /// 64-bit float vector; `None` is NA, `Some(NAN)` is NaN.
    Double(Vec<Option<f64>>),
    /// Byte-string vector; `None` is NA.
    Character(Vec<Option<String>>),
    /// Two-dimensional shape over one of the vector types.
    Matrix(RMatrix),
    /// Scalar results of singleton unwrapping.
    Bool(Option<bool>),
    Int(Option<i32>),
    Num(Option<f64>),
    /// The engine had no binding for the requested expression.
    Missing,
}

/// A matrix: row/column extents plus a flattened element vector.
///
/// Element order is row-major host-side and on the wire; the engine-side
/// glue converts to its native column-major layout on receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct RMatrix {
    rows: usize,
    cols: usize,
    data: Box<RValue>,
}

impl RMatrix {
    /// Build a matrix over a flattened row-major element vector.
    ///
    /// # Errors
    ///
    /// Rejects non-vector element data and extent/length mismatches.
    pub fn new(rows: usize, cols: usize, data: RValue) -> Result<Self, RBridgeError> {
        match &data {
            RValue::Logical(_) | RValue::Integer(_) | RValue::Double(_) | RValue::Character(_) => {}
            other => {
                return Err(RBridgeError::Protocol(format!(
                    "matrix elements must be a vector type, got {}",
                    other.type_name()
                )))
            }
        }
        if data.len() != rows * cols {
            return Err(RBridgeError::Protocol(format!(
                "matrix extent {rows}x{cols} does not match {} elements",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            data: Box::new(data),
        })
    }

    /// Build a numeric matrix from rows of equal length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, RBridgeError> {
        let nrow = rows.len();
        let ncol = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != ncol) {
            return Err(RBridgeError::Protocol(
                "matrix rows have unequal lengths".to_string(),
            ));
        }
        let flat: Vec<Option<f64>> = rows.into_iter().flatten().map(Some).collect();
        Self::new(nrow, ncol, RValue::Double(flat))
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The flattened row-major element vector.
    pub fn data(&self) -> &RValue {
        &self.data
    }

    /// Numeric element accessor; `None` for NA or out-of-range indices.
    /// Integer elements coerce to f64.
    pub fn f64_at(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let idx = row * self.cols + col;
        match self.data.as_ref() {
            RValue::Double(v) => v[idx],
            RValue::Integer(v) => v[idx].map(f64::from),
            _ => None,
        }
    }
}

impl RValue {
    /// Number of elements (scalars count as one, `Missing` as zero).
    pub fn len(&self) -> usize {
        match self {
            RValue::Logical(v) => v.len(),
            RValue::Integer(v) => v.len(),
            RValue::Double(v) => v.len(),
            RValue::Character(v) => v.len(),
            RValue::Matrix(m) => m.rows * m.cols,
            RValue::Bool(_) | RValue::Int(_) | RValue::Num(_) => 1,
            RValue::Missing => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, RValue::Missing)
    }

    /// Short name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            RValue::Logical(_) => "logical",
            RValue::Integer(_) => "integer",
            RValue::Double(_) => "double",
            RValue::Character(_) => "character",
            RValue::Matrix(_) => "matrix",
            RValue::Bool(_) => "bool",
            RValue::Int(_) => "int",
            RValue::Num(_) => "num",
            RValue::Missing => "missing",
        }
    }

    /// Unwrap single-element non-character vectors to their scalar form.
    /// Everything else passes through unchanged.
    pub fn unwrap_singleton(self) -> RValue {
        match self {
            RValue::Logical(v) if v.len() == 1 => RValue::Bool(v[0]),
            RValue::Integer(v) if v.len() == 1 => RValue::Int(v[0]),
            RValue::Double(v) if v.len() == 1 => RValue::Num(v[0]),
            other => other,
        }
    }

    /// Scalar f64 accessor with integer coercion. Works on scalars and
    /// one-element vectors; `None` for NA or anything else.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RValue::Num(x) => *x,
            RValue::Int(x) => x.map(f64::from),
            RValue::Double(v) if v.len() == 1 => v[0],
            RValue::Integer(v) if v.len() == 1 => v[0].map(f64::from),
            _ => None,
        }
    }

    /// Scalar i32 accessor; `None` for NA, non-integers, or vectors.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RValue::Int(x) => *x,
            RValue::Integer(v) if v.len() == 1 => v[0],
            _ => None,
        }
    }

    /// Scalar bool accessor.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RValue::Bool(x) => *x,
            RValue::Logical(v) if v.len() == 1 => v[0],
            _ => None,
        }
    }

    /// Scalar string accessor (one-element character vectors only;
    /// character values never unwrap on pull).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RValue::Character(v) if v.len() == 1 => v[0].as_deref(),
            _ => None,
        }
    }

    /// Numeric vector view with integer coercion.
    pub fn to_f64_vec(&self) -> Option<Vec<Option<f64>>> {
        match self {
            RValue::Double(v) => Some(v.clone()),
            RValue::Integer(v) => Some(v.iter().map(|x| x.map(f64::from)).collect()),
            RValue::Num(x) => Some(vec![*x]),
            RValue::Int(x) => Some(vec![x.map(f64::from)]),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&RMatrix> {
        match self {
            RValue::Matrix(m) => Some(m),
            _ => None,
        }
    }

    /// Normalize a value for transmission, applying the encoding policy:
    ///
    /// - scalars widen to one-element vectors;
    /// - `Double` vectors whose elements are all integral and inside the
    ///   representable 32-bit range demote to `Integer`;
    /// - `Integer` vectors containing the reserved NA bit pattern as data
    ///   promote to `Double`;
    /// - `Missing` becomes a one-element logical NA (the engine's untyped
    ///   missing value);
    /// - matrices apply the same policy to their element vector.
    pub(crate) fn normalized_for_wire(&self) -> RValue {
        match self {
            RValue::Bool(x) => RValue::Logical(vec![*x]),
            RValue::Int(x) => RValue::Integer(vec![*x]).normalized_for_wire(),
            RValue::Num(x) => RValue::Double(vec![*x]).normalized_for_wire(),
            RValue::Missing => RValue::Logical(vec![None]),
            RValue::Double(v) => {
                if v.iter().all(|x| x.map_or(true, double_fits_integer)) {
                    RValue::Integer(v.iter().map(|x| x.map(|f| f as i32)).collect())
                } else {
                    RValue::Double(v.clone())
                }
            }
            RValue::Integer(v) => {
                if v.contains(&Some(NA_INTEGER)) {
                    RValue::Double(v.iter().map(|x| x.map(f64::from)).collect())
                } else {
                    RValue::Integer(v.clone())
                }
            }
            RValue::Logical(v) => RValue::Logical(v.clone()),
            RValue::Character(v) => RValue::Character(v.clone()),
            RValue::Matrix(m) => {
                let data = m.data.normalized_for_wire();
                RValue::Matrix(RMatrix {
                    rows: m.rows,
                    cols: m.cols,
                    data: Box::new(data),
                })
            }
        }
    }
}

/// True if an f64 is integral and inside the range `Integer` can carry
/// without colliding with the NA sentinel.
fn double_fits_integer(x: f64) -> bool {
    x.is_finite() && x.fract() == 0.0 && x > f64::from(NA_INTEGER) && x <= f64::from(i32::MAX)
}

// Conversions for ergonomic assign calls.

impl From<bool> for RValue {
    fn from(x: bool) -> Self {
        RValue::Bool(Some(x))
    }
}

impl From<i32> for RValue {
    fn from(x: i32) -> Self {
        RValue::Int(Some(x))
    }
}

impl From<f64> for RValue {
    fn from(x: f64) -> Self {
        RValue::Num(Some(x))
    }
}

impl From<&str> for RValue {
    fn from(s: &str) -> Self {
        RValue::Character(vec![Some(s.to_string())])
    }
}

impl From<String> for RValue {
    fn from(s: String) -> Self {
        RValue::Character(vec![Some(s)])
    }
}

impl From<Vec<bool>> for RValue {
    fn from(v: Vec<bool>) -> Self {
        RValue::Logical(v.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<bool>>> for RValue {
    fn from(v: Vec<Option<bool>>) -> Self {
        RValue::Logical(v)
    }
}

impl From<Vec<i32>> for RValue {
    fn from(v: Vec<i32>) -> Self {
        RValue::Integer(v.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<i32>>> for RValue {
    fn from(v: Vec<Option<i32>>) -> Self {
        RValue::Integer(v)
    }
}

impl From<Vec<f64>> for RValue {
    fn from(v: Vec<f64>) -> Self {
        RValue::Double(v.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<f64>>> for RValue {
    fn from(v: Vec<Option<f64>>) -> Self {
        RValue::Double(v)
    }
}

impl From<&[f64]> for RValue {
    fn from(v: &[f64]) -> Self {
        RValue::Double(v.iter().copied().map(Some).collect())
    }
}

impl From<Vec<String>> for RValue {
    fn from(v: Vec<String>) -> Self {
        RValue::Character(v.into_iter().map(Some).collect())
    }
}

impl From<Vec<&str>> for RValue {
    fn from(v: Vec<&str>) -> Self {
        RValue::Character(v.into_iter().map(|s| Some(s.to_string())).collect())
    }
}

impl From<Vec<Option<String>>> for RValue {
    fn from(v: Vec<Option<String>>) -> Self {
        RValue::Character(v)
    }
}

impl From<RMatrix> for RValue {
    fn from(m: RMatrix) -> Self {
        RValue::Matrix(m)
    }
}
