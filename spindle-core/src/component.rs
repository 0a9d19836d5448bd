//! Component data definitions.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::EntityId;

/// Schema-level component identifier.
pub type ComponentId = u32;

/// Named set of values, used for component fields and command payloads.
pub type Fields = BTreeMap<String, Value>;

/// Single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    EntityRef(EntityId),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Value::EntityRef(id) => Some(*id),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::EntityRef(id) => write!(f, "entity:{}", id),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Complete state of a single component attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentData {
    pub component_id: ComponentId,
    pub fields: Fields,
}

impl ComponentData {
    pub fn new(component_id: ComponentId) -> Self {
        Self {
            component_id,
            fields: Fields::new(),
        }
    }

    pub fn with_field<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Merges the update into this component's fields.
    ///
    /// Fields present in the update overwrite existing ones, cleared fields
    /// are removed, everything else stays untouched.
    pub fn apply_update(&mut self, update: &ComponentUpdate) {
        for (name, value) in &update.fields {
            self.fields.insert(name.clone(), value.clone());
        }
        for name in &update.cleared_fields {
            self.fields.remove(name);
        }
    }
}

/// Partial change to a component's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentUpdate {
    pub component_id: ComponentId,
    pub fields: Fields,
    pub cleared_fields: Vec<String>,
}

impl ComponentUpdate {
    pub fn new(component_id: ComponentId) -> Self {
        Self {
            component_id,
            fields: Fields::new(),
            cleared_fields: Vec::new(),
        }
    }

    pub fn with_field<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn clear_field(mut self, name: &str) -> Self {
        self.cleared_fields.push(name.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.cleared_fields.is_empty()
    }
}

/// Set of components a worker wants to observe.
///
/// An empty component list means the worker is interested in everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interest {
    pub components: Vec<ComponentId>,
}

impl Interest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn components(components: Vec<ComponentId>) -> Self {
        Self { components }
    }

    pub fn includes(&self, component_id: ComponentId) -> bool {
        self.components.is_empty() || self.components.contains(&component_id)
    }

    /// Checks whether any of the listed components is of interest.
    pub fn includes_any<'a, I>(&self, mut component_ids: I) -> bool
    where
        I: Iterator<Item = &'a ComponentId>,
    {
        self.components.is_empty() || component_ids.any(|id| self.components.contains(id))
    }
}
