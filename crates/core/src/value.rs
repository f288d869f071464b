//! Correction payloads.

use serde::{Deserialize, Serialize};

/// The value carried by a correction record.
///
/// The store never interprets a value beyond two questions: are two values
/// the same ([`values_equal`]), and can they be linearly interpolated
/// ([`CorrectionValue::interpolate`]). Serialized untagged so the persisted
/// document carries the raw payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrectionValue {
    Boolean(bool),
    Number(f64),
    /// A fixed-length numeric vector, e.g. one entry per channel.
    Vector(Vec<f64>),
    Text(String),
    /// Anything else: maps, mixed arrays, references to external resources.
    Structured(serde_json::Value),
}

/// The single equality contract used by every update-legality check.
///
/// - numbers compare exactly, with `NaN` equal to `NaN` (stored values are
///   always finite, see [`CorrectionValue::is_finite`]);
/// - vectors compare element-wise under the same rule;
/// - text and booleans compare by value;
/// - structured payloads compare as JSON trees;
/// - values of different variants are never equal.
pub fn values_equal(a: &CorrectionValue, b: &CorrectionValue) -> bool {
    use CorrectionValue::*;
    match (a, b) {
        (Boolean(x), Boolean(y)) => x == y,
        (Number(x), Number(y)) => floats_equal(*x, *y),
        (Vector(x), Vector(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| floats_equal(*a, *b))
        }
        (Text(x), Text(y)) => x == y,
        (Structured(x), Structured(y)) => x == y,
        _ => false,
    }
}

fn floats_equal(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl CorrectionValue {
    pub fn is_numeric(&self) -> bool {
        matches!(self, CorrectionValue::Number(_) | CorrectionValue::Vector(_))
    }

    /// Whether every number in the payload is finite. Documents are JSON,
    /// which has no encoding for `NaN` or infinities.
    pub fn is_finite(&self) -> bool {
        match self {
            CorrectionValue::Number(n) => n.is_finite(),
            CorrectionValue::Vector(v) => v.iter().all(|n| n.is_finite()),
            _ => true,
        }
    }

    /// The JSON payload as written to a document.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            CorrectionValue::Boolean(b) => Json::Bool(*b),
            CorrectionValue::Number(n) => Json::from(*n),
            CorrectionValue::Vector(v) => Json::Array(v.iter().copied().map(Json::from).collect()),
            CorrectionValue::Text(s) => Json::String(s.clone()),
            CorrectionValue::Structured(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CorrectionValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// `self + fraction * (next - self)`.
    ///
    /// Returns `None` when the pair cannot be interpolated: non-numeric
    /// payloads, mismatched variants, or vectors of different lengths.
    pub fn interpolate(&self, next: &CorrectionValue, fraction: f64) -> Option<CorrectionValue> {
        match (self, next) {
            (CorrectionValue::Number(a), CorrectionValue::Number(b)) => {
                Some(CorrectionValue::Number(lerp(*a, *b, fraction)))
            }
            (CorrectionValue::Vector(a), CorrectionValue::Vector(b)) if a.len() == b.len() => {
                Some(CorrectionValue::Vector(
                    a.iter().zip(b).map(|(x, y)| lerp(*x, *y, fraction)).collect(),
                ))
            }
            _ => None,
        }
    }
}

fn lerp(a: f64, b: f64, fraction: f64) -> f64 {
    a + fraction * (b - a)
}

impl From<f64> for CorrectionValue {
    fn from(n: f64) -> Self {
        CorrectionValue::Number(n)
    }
}
impl From<Vec<f64>> for CorrectionValue {
    fn from(v: Vec<f64>) -> Self {
        CorrectionValue::Vector(v)
    }
}
impl From<&str> for CorrectionValue {
    fn from(s: &str) -> Self {
        CorrectionValue::Text(s.to_string())
    }
}
impl From<String> for CorrectionValue {
    fn from(s: String) -> Self {
        CorrectionValue::Text(s)
    }
}
impl From<bool> for CorrectionValue {
    fn from(b: bool) -> Self {
        CorrectionValue::Boolean(b)
    }
}

/// Picks the narrowest variant, the same way deserializing a document does.
impl From<serde_json::Value> for CorrectionValue {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match v {
            Json::Bool(b) => CorrectionValue::Boolean(b),
            Json::Number(n) => match n.as_f64() {
                Some(f) => CorrectionValue::Number(f),
                None => CorrectionValue::Structured(Json::Number(n)),
            },
            Json::String(s) => CorrectionValue::Text(s),
            Json::Array(items) => {
                let numbers: Option<Vec<f64>> = items.iter().map(Json::as_f64).collect();
                match numbers {
                    Some(numbers) => CorrectionValue::Vector(numbers),
                    None => CorrectionValue::Structured(Json::Array(items)),
                }
            }
            other => CorrectionValue::Structured(other),
        }
    }
}

impl std::fmt::Display for CorrectionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrectionValue::Boolean(b) => write!(f, "{b}"),
            CorrectionValue::Number(n) => write!(f, "{n}"),
            CorrectionValue::Vector(v) => {
                let parts: Vec<String> = v.iter().map(f64::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            CorrectionValue::Text(s) => write!(f, "{s}"),
            CorrectionValue::Structured(v) => write!(f, "{v}"),
        }
    }
}
