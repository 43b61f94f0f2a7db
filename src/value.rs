//! Values observed at node dispatch time.
//!
//! The declared graph only carries literals and references, but once the host
//! resolves a node's inputs they may hold anything: plain JSON-like data,
//! latent tensors, or host objects such as conditioning or decoded images.
//! The collector never looks inside host objects. They are kept as a
//! type-erased [`Payload`] and compared by identity.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A type-erased, thread-safe host object.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Resolved inputs of a single node dispatch, keyed by input name.
pub type Inputs = BTreeMap<String, Value>;

/// Outputs of a single node dispatch, indexed by output slot.
pub type Outputs = Vec<Value>;

/// Latent tensor description, only the shape is of interest.
///
/// Shapes follow the `[batch, channels, height, width]` layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Latent {
    pub shape: Vec<usize>,
}

impl Latent {
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
        }
    }

    /// Latent `(width, height)`, if the shape has at least two dimensions.
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        match self.shape.as_slice() {
            [.., height, width] => Some((*width, *height)),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub enum Value {
    Json(serde_json::Value),
    Latent(Latent),
    Object(Payload),
}

impl Value {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Value::Object(Arc::new(value))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(serde_json::Value::as_str)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(serde_json::Value::as_f64)
    }

    pub fn as_latent(&self) -> Option<&Latent> {
        match self {
            Value::Latent(latent) => Some(latent),
            _ => None,
        }
    }

    pub fn as_payload(&self) -> Option<&Payload> {
        match self {
            Value::Object(payload) => Some(payload),
            _ => None,
        }
    }

    /// Scalar literals worth keeping as sampler parameters.
    pub(crate) fn as_scalar(&self) -> Option<&serde_json::Value> {
        self.as_json()
            .filter(|value| value.is_number() || value.is_string() || value.is_boolean())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl From<Latent> for Value {
    fn from(value: Latent) -> Self {
        Value::Latent(value)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Json(value) => write!(f, "Json({value})"),
            Value::Latent(latent) => write!(f, "Latent({:?})", latent.shape),
            Value::Object(_) => write!(f, "Object(*)"),
        }
    }
}

/// Identity comparison for optional host objects.
pub(crate) fn same_payload(a: Option<&Payload>, b: Option<&Payload>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
