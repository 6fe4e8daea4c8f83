// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lite Data Objects: typed, timestamped, annotated parameters.
//!
//! An LDO's value is always a sequence, never a bare scalar; scalars travel
//! as length-1 sequences. Multi-dimensional numeric data is a packed byte
//! buffer with explicit shape and element dtype, matching the
//! `{"value": bytes, "numpy": [shape, dtype]}` wire convention.

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::util::now_ts;

// ============================================================================
// VALUE MODEL
// ============================================================================

/// Element type of a packed n-d array, by its compact wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl Dtype {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::U8 => "uint8",
            Dtype::I8 => "int8",
            Dtype::U16 => "uint16",
            Dtype::I16 => "int16",
            Dtype::U32 => "uint32",
            Dtype::I32 => "int32",
            Dtype::F32 => "float32",
            Dtype::F64 => "float64",
        }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "uint8" => Ok(Dtype::U8),
            "int8" => Ok(Dtype::I8),
            "uint16" => Ok(Dtype::U16),
            "int16" => Ok(Dtype::I16),
            "uint32" => Ok(Dtype::U32),
            "int32" => Ok(Dtype::I32),
            "float32" => Ok(Dtype::F32),
            "float64" => Ok(Dtype::F64),
            other => Err(Error::Value(format!("unknown dtype tag \"{other}\""))),
        }
    }

    /// Element size in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Dtype::U8 | Dtype::I8 => 1,
            Dtype::U16 | Dtype::I16 => 2,
            Dtype::U32 | Dtype::I32 | Dtype::F32 => 4,
            Dtype::F64 => 8,
        }
    }
}

/// Packed multi-dimensional numeric array.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub data: Vec<u8>,
}

impl NdArray {
    /// Build an array, checking that the data length matches shape x dtype.
    pub fn new(shape: Vec<usize>, dtype: Dtype, data: Vec<u8>) -> Result<Self> {
        let elements: usize = shape.iter().product();
        if elements * dtype.size() != data.len() {
            return Err(Error::Value(format!(
                "array data of {} bytes does not match shape {:?} of {}",
                data.len(),
                shape,
                dtype.as_str()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// The value of one LDO: a homogeneous scalar sequence or a packed array.
#[derive(Debug, Clone, PartialEq)]
pub enum LdoValue {
    /// Action parameters carry no data; `set` runs their hook only.
    Null,
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Bools(Vec<bool>),
    Strs(Vec<String>),
    Array(NdArray),
}

impl LdoValue {
    #[must_use]
    pub fn ints(v: impl Into<Vec<i64>>) -> Self {
        LdoValue::Ints(v.into())
    }

    #[must_use]
    pub fn floats(v: impl Into<Vec<f64>>) -> Self {
        LdoValue::Floats(v.into())
    }

    #[must_use]
    pub fn bools(v: impl Into<Vec<bool>>) -> Self {
        LdoValue::Bools(v.into())
    }

    /// A length-1 string sequence.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        LdoValue::Strs(vec![s.into()])
    }

    #[must_use]
    pub fn strs(v: Vec<String>) -> Self {
        LdoValue::Strs(v)
    }

    /// Cardinality of the value.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            LdoValue::Null => 1,
            LdoValue::Ints(v) => v.len(),
            LdoValue::Floats(v) => v.len(),
            LdoValue::Bools(v) => v.len(),
            LdoValue::Strs(v) => v.len(),
            LdoValue::Array(a) => a.element_count(),
        }
    }

    /// Derived type name exposed as the `type` property.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            LdoValue::Null => "none",
            LdoValue::Ints(_) => "int",
            LdoValue::Floats(_) => "float",
            LdoValue::Bools(_) => "bool",
            LdoValue::Strs(_) => "str",
            LdoValue::Array(a) => a.dtype.as_str(),
        }
    }

    /// First element as text, for discrete string parameters like `run`.
    #[must_use]
    pub fn first_str(&self) -> Option<&str> {
        match self {
            LdoValue::Strs(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    /// Wire representation: the `value` entry, plus a `numpy` entry for
    /// packed arrays.
    #[must_use]
    pub fn to_wire_pairs(&self) -> Vec<(String, Value)> {
        match self {
            LdoValue::Null => vec![("value".to_string(), Value::Array(vec![Value::Null]))],
            LdoValue::Ints(v) => vec![(
                "value".to_string(),
                Value::Array(v.iter().map(|&i| Value::Int(i)).collect()),
            )],
            LdoValue::Floats(v) => vec![(
                "value".to_string(),
                Value::Array(v.iter().map(|&x| Value::Float(x)).collect()),
            )],
            LdoValue::Bools(v) => vec![(
                "value".to_string(),
                Value::Array(v.iter().map(|&b| Value::Bool(b)).collect()),
            )],
            LdoValue::Strs(v) => vec![(
                "value".to_string(),
                Value::Array(v.iter().map(|s| Value::str(s.clone())).collect()),
            )],
            LdoValue::Array(a) => vec![
                ("value".to_string(), Value::Bytes(a.data.clone())),
                (
                    "numpy".to_string(),
                    Value::Array(vec![
                        Value::Array(a.shape.iter().map(|&d| Value::Int(d as i64)).collect()),
                        Value::str(a.dtype.as_str()),
                    ]),
                ),
            ],
        }
    }

    /// Decode a wire `value` (with its optional `numpy` sibling) back into an
    /// [`LdoValue`]. Bare scalars wrap into length-1 sequences.
    pub fn from_wire(value: &Value, numpy: Option<&Value>) -> Result<Self> {
        if let Some(meta) = numpy {
            let pair = meta
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| Error::Protocol("numpy entry must be [shape, dtype]".into()))?;
            let shape = pair[0]
                .as_array()
                .ok_or_else(|| Error::Protocol("numpy shape must be a sequence".into()))?
                .iter()
                .map(|v| {
                    v.as_i64()
                        .and_then(|d| usize::try_from(d).ok())
                        .ok_or_else(|| Error::Protocol("bad numpy dimension".into()))
                })
                .collect::<Result<Vec<usize>>>()?;
            let dtype = Dtype::parse(
                pair[1]
                    .as_str()
                    .ok_or_else(|| Error::Protocol("numpy dtype must be a string".into()))?,
            )?;
            let data = value
                .as_bytes()
                .ok_or_else(|| Error::Protocol("numpy value must be raw bytes".into()))?
                .to_vec();
            return Ok(LdoValue::Array(NdArray::new(shape, dtype, data)?));
        }

        let items: Vec<Value> = match value {
            Value::Array(items) => items.clone(),
            Value::Bytes(b) => {
                // A bytes payload without numpy metadata is a flat uint8 vector.
                return Ok(LdoValue::Array(NdArray::new(
                    vec![b.len()],
                    Dtype::U8,
                    b.clone(),
                )?));
            }
            scalar => vec![scalar.clone()],
        };
        if items.is_empty() {
            return Ok(LdoValue::Ints(Vec::new()));
        }
        // Homogeneous by the first element; a lone float promotes the rest.
        match &items[0] {
            Value::Null => Ok(LdoValue::Null),
            Value::Bool(_) => items
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Ok(*b),
                    _ => Err(Error::Value("mixed bool sequence".into())),
                })
                .collect::<Result<Vec<bool>>>()
                .map(LdoValue::Bools),
            Value::Str(_) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Error::Value("mixed string sequence".into()))
                })
                .collect::<Result<Vec<String>>>()
                .map(LdoValue::Strs),
            Value::Int(_) if items.iter().all(|v| matches!(v, Value::Int(_))) => Ok(
                LdoValue::Ints(items.iter().filter_map(Value::as_i64).collect()),
            ),
            Value::Int(_) | Value::Float(_) => items
                .iter()
                .map(|v| {
                    v.as_f64()
                        .ok_or_else(|| Error::Value("mixed numeric sequence".into()))
                })
                .collect::<Result<Vec<f64>>>()
                .map(LdoValue::Floats),
            other => Err(Error::Value(format!(
                "unsupported value element {other:?}"
            ))),
        }
    }
}

/// One enumerated legal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Scalar::Str(s.into())
    }

    fn to_value(&self) -> Value {
        match self {
            Scalar::Int(i) => Value::Int(*i),
            Scalar::Float(x) => Value::Float(*x),
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Str(s) => Value::str(s.clone()),
        }
    }
}

// ============================================================================
// FEATURES
// ============================================================================

/// Feature letters of a parameter, a subset of `RWDEI`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features(String);

impl Features {
    #[must_use]
    pub fn new(letters: &str) -> Self {
        Self(letters.to_string())
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        self.0.contains('R')
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.0.contains('W')
    }

    #[must_use]
    pub fn discrete(&self) -> bool {
        self.0.contains('D')
    }

    #[must_use]
    pub fn editable(&self) -> bool {
        self.0.contains('E')
    }

    #[must_use]
    pub fn diagnostic(&self) -> bool {
        self.0.contains('I')
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// LDO
// ============================================================================

/// One named parameter of a device.
#[derive(Debug, Clone)]
pub struct Ldo {
    value: LdoValue,
    timestamp: f64,
    features: Features,
    desc: String,
    units: Option<String>,
    type_name: String,
    op_limits: Option<(Option<f64>, Option<f64>)>,
    legal_values: Option<Vec<Scalar>>,
}

impl Ldo {
    /// Create a parameter; the type name derives from the initial value.
    #[must_use]
    pub fn new(features: &str, desc: &str, value: LdoValue) -> Self {
        let type_name = value.type_name().to_string();
        Self {
            value,
            timestamp: now_ts(),
            features: Features::new(features),
            desc: desc.to_string(),
            units: None,
            type_name,
            op_limits: None,
            legal_values: None,
        }
    }

    #[must_use]
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Inclusive numeric bounds; `None` on either side leaves it unchecked.
    #[must_use]
    pub fn with_op_limits(mut self, low: Option<f64>, high: Option<f64>) -> Self {
        self.op_limits = Some((low, high));
        self
    }

    #[must_use]
    pub fn with_legal_values(mut self, values: Vec<Scalar>) -> Self {
        self.legal_values = Some(values);
        self
    }

    #[must_use]
    pub fn value(&self) -> &LdoValue {
        &self.value
    }

    #[must_use]
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    #[must_use]
    pub fn features(&self) -> &Features {
        &self.features
    }

    #[must_use]
    pub fn desc(&self) -> &str {
        &self.desc
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.features.readable()
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.features.writable()
    }

    /// Atomic write of value and timestamp; the device-thread production path.
    pub fn set_value_and_timestamp(&mut self, value: LdoValue, timestamp: f64) {
        self.value = value;
        self.timestamp = timestamp;
    }

    /// Revert after a failed set hook.
    pub(crate) fn restore(&mut self, previous: LdoValue) {
        self.value = previous;
    }

    /// Validated write: coercion toward the declared type, then limit and
    /// legal-value checks, then assignment with a fresh timestamp. A failing
    /// set leaves the LDO unchanged.
    pub fn set(&mut self, incoming: LdoValue) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::Permission("LDO is not writable".into()));
        }
        // Action parameters carry no data: run the hook path, mark the time.
        if matches!(self.value, LdoValue::Null) {
            self.timestamp = now_ts();
            return Ok(());
        }
        let coerced = self.coerce(incoming)?;
        self.check_op_limits(&coerced)?;
        self.check_legal_values(&coerced)?;
        self.value = coerced;
        self.timestamp = now_ts();
        Ok(())
    }

    fn coerce(&self, incoming: LdoValue) -> Result<LdoValue> {
        // A length-1 boolean parameter accepts anything truthy.
        if matches!(self.value, LdoValue::Bools(ref v) if v.len() == 1) {
            return Ok(LdoValue::Bools(vec![truthy_first(&incoming)]));
        }
        match (&self.value, incoming) {
            (LdoValue::Ints(_), LdoValue::Ints(v)) => Ok(LdoValue::Ints(v)),
            (LdoValue::Ints(_), LdoValue::Floats(v)) => {
                log::warn!("Setting int parameter from float values");
                Ok(LdoValue::Ints(v.into_iter().map(|x| x as i64).collect()))
            }
            (LdoValue::Ints(_), LdoValue::Bools(v)) => {
                log::warn!("Setting int parameter from bool values");
                Ok(LdoValue::Ints(v.into_iter().map(i64::from).collect()))
            }
            (LdoValue::Ints(_), LdoValue::Strs(v)) => {
                log::warn!("Setting int parameter from string values");
                v.iter()
                    .map(|s| {
                        s.parse::<i64>()
                            .map_err(|_| Error::Value(format!("cannot convert \"{s}\" to int")))
                    })
                    .collect::<Result<Vec<i64>>>()
                    .map(LdoValue::Ints)
            }
            (LdoValue::Floats(_), LdoValue::Floats(v)) => Ok(LdoValue::Floats(v)),
            (LdoValue::Floats(_), LdoValue::Ints(v)) => {
                log::warn!("Setting float parameter from int values");
                Ok(LdoValue::Floats(v.into_iter().map(|i| i as f64).collect()))
            }
            (LdoValue::Floats(_), LdoValue::Strs(v)) => {
                log::warn!("Setting float parameter from string values");
                v.iter()
                    .map(|s| {
                        s.parse::<f64>()
                            .map_err(|_| Error::Value(format!("cannot convert \"{s}\" to float")))
                    })
                    .collect::<Result<Vec<f64>>>()
                    .map(LdoValue::Floats)
            }
            (LdoValue::Strs(_), LdoValue::Strs(v)) => Ok(LdoValue::Strs(v)),
            (LdoValue::Strs(_), LdoValue::Ints(v)) => {
                log::warn!("Setting string parameter from int values");
                Ok(LdoValue::Strs(v.iter().map(i64::to_string).collect()))
            }
            (LdoValue::Strs(_), LdoValue::Floats(v)) => {
                log::warn!("Setting string parameter from float values");
                Ok(LdoValue::Strs(v.iter().map(f64::to_string).collect()))
            }
            (LdoValue::Bools(_), LdoValue::Bools(v)) => Ok(LdoValue::Bools(v)),
            (LdoValue::Array(current), LdoValue::Array(new)) => {
                if new.dtype != current.dtype {
                    return Err(Error::Value(format!(
                        "array dtype mismatch: parameter is {}, got {}",
                        current.dtype.as_str(),
                        new.dtype.as_str()
                    )));
                }
                Ok(LdoValue::Array(new))
            }
            (declared, got) => Err(Error::Value(format!(
                "cannot convert {} value to {}",
                got.type_name(),
                declared.type_name()
            ))),
        }
    }

    fn check_op_limits(&self, value: &LdoValue) -> Result<()> {
        let Some((low, high)) = self.op_limits else {
            return Ok(());
        };
        let numeric: Vec<f64> = match value {
            LdoValue::Ints(v) => v.iter().map(|&i| i as f64).collect(),
            LdoValue::Floats(v) => v.clone(),
            _ => return Ok(()),
        };
        for &x in &numeric {
            if low.is_some_and(|lo| x < lo) || high.is_some_and(|hi| x > hi) {
                return Err(Error::Value(format!(
                    "out of opLimits {:?}: {x}",
                    (low, high)
                )));
            }
        }
        Ok(())
    }

    fn check_legal_values(&self, value: &LdoValue) -> Result<()> {
        let Some(legal) = &self.legal_values else {
            return Ok(());
        };
        let ok = match value {
            LdoValue::Ints(v) => v
                .iter()
                .all(|i| legal.iter().any(|s| matches!(s, Scalar::Int(l) if l == i))),
            LdoValue::Floats(v) => v.iter().all(|x| {
                legal
                    .iter()
                    .any(|s| matches!(s, Scalar::Float(l) if l == x))
            }),
            LdoValue::Bools(v) => v
                .iter()
                .all(|b| legal.iter().any(|s| matches!(s, Scalar::Bool(l) if l == b))),
            LdoValue::Strs(v) => v
                .iter()
                .all(|t| legal.iter().any(|s| matches!(s, Scalar::Str(l) if l == t))),
            LdoValue::Null | LdoValue::Array(_) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Value(format!(
                "not a legal value: {value:?}"
            )))
        }
    }

    /// Metadata property lookup for `info` and property-selected `get`.
    /// `value` is not served here; it goes through [`LdoValue::to_wire_pairs`].
    #[must_use]
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            "timestamp" => Some(Value::Float(self.timestamp)),
            "count" => Some(Value::Array(vec![Value::Int(self.value.count() as i64)])),
            "features" => Some(Value::str(self.features.as_str())),
            "desc" => Some(Value::str(self.desc.clone())),
            "type" => Some(Value::str(self.type_name.clone())),
            "units" => self.units.as_ref().map(|u| Value::str(u.clone())),
            "opLimits" => self.op_limits.map(|(low, high)| {
                Value::Array(vec![
                    low.map_or(Value::Null, Value::Float),
                    high.map_or(Value::Null, Value::Float),
                ])
            }),
            "legalValues" => self
                .legal_values
                .as_ref()
                .map(|legal| Value::Array(legal.iter().map(Scalar::to_value).collect())),
            _ => None,
        }
    }

    /// Names of the properties present on this parameter, in a stable order.
    #[must_use]
    pub fn info_properties(&self) -> Vec<&'static str> {
        let mut props = vec!["timestamp", "count", "value", "features", "desc"];
        if self.units.is_some() {
            props.push("units");
        }
        props.push("type");
        if self.op_limits.is_some() {
            props.push("opLimits");
        }
        if self.legal_values.is_some() {
            props.push("legalValues");
        }
        props
    }
}

/// Python-style truthiness of the first element.
fn truthy_first(value: &LdoValue) -> bool {
    match value {
        LdoValue::Null => false,
        LdoValue::Ints(v) => v.first().is_some_and(|&i| i != 0),
        LdoValue::Floats(v) => v.first().is_some_and(|&x| x != 0.0),
        LdoValue::Bools(v) => v.first().copied().unwrap_or(false),
        LdoValue::Strs(v) => v.first().is_some_and(|s| !s.is_empty()),
        LdoValue::Array(a) => !a.data.is_empty(),
    }
}
