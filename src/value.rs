// src/value.rs - Typed tag values, declared data types and quality codes
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value carried by a normalized reading.
///
/// Every reading's value has already been coerced to the [`DataType`]
/// declared for its tag in the registry.
///
/// # Examples
///
/// ```rust
/// use plantgraph::Value;
///
/// let flow = Value::Float(42.5);
/// let running = Value::Bool(true);
///
/// assert_eq!(flow.as_float(), Some(42.5));
/// assert_eq!(running.as_float(), Some(1.0));
/// assert_eq!(Value::String("open".into()).as_float(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Floating-point value (64-bit)
    Float(f64),
    /// Free-form string value
    String(String),
}

/// Data type declared for a tag in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "float", alias = "double", alias = "number", alias = "analog")]
    Numeric,
    #[serde(alias = "bool", alias = "digital")]
    Boolean,
    #[serde(alias = "text", alias = "str")]
    String,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Numeric => "numeric",
            DataType::Boolean => "boolean",
            DataType::String => "string",
        }
    }

    /// Parse the registry spelling of a data type.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "numeric" | "float" | "double" | "number" | "analog" | "int" | "integer" => {
                Some(DataType::Numeric)
            }
            "boolean" | "bool" | "digital" => Some(DataType::Boolean),
            "string" | "text" | "str" => Some(DataType::String),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Quality flag attached to every reading.
///
/// `OutOfRange` is set by the normalizer when a value falls outside the
/// tag's valid range; the reading is still forwarded and evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    #[default]
    Good,
    Uncertain,
    Bad,
    OutOfRange,
}

impl Quality {
    /// Parse a source quality column. OPC-style numeric codes are accepted
    /// (192 = good, 64 = uncertain, 0 = bad).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "good" | "ok" | "192" => Some(Quality::Good),
            "uncertain" | "questionable" | "64" => Some(Quality::Uncertain),
            "bad" | "0" => Some(Quality::Bad),
            "out-of-range" | "out_of_range" | "outofrange" => Some(Quality::OutOfRange),
            _ => None,
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, Quality::Bad)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
            Quality::OutOfRange => "out-of-range",
        }
    }
}

impl Value {
    /// Convert to float if possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(_) => None,
        }
    }

    /// Convert to boolean if possible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Float(f) => Some(*f != 0.0 && !f.is_nan()),
            Value::String(s) => parse_bool(s),
        }
    }

    /// Get the data type this value carries
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Boolean,
            Value::Float(_) => DataType::Numeric,
            Value::String(_) => DataType::String,
        }
    }

    /// Approximate in-memory footprint, used for byte-bounded chunking
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Bool(_) => 1,
            Value::Float(_) => 8,
            Value::String(s) => s.len(),
        }
    }

    /// Plain JSON rendering without the type envelope, for graph properties
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Shared boolean spellings for registry values and raw inputs.
pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
