//! Declarative parameter schemas for analysis executors.
//!
//! Each executor declares its parameters once; [`ParamSchema::validate`]
//! checks a raw request map against it (types, ranges, allowed values,
//! required entries) and fills in defaults. The validated [`Params`] also
//! provide the canonical JSON used in result fingerprints.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::{EchoError, EchoResult};
use crate::models::ParamValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Integer,
    Number,
    Text,
    TextList,
}

impl ParamType {
    fn name(&self) -> &'static str {
        match self {
            ParamType::Bool => "boolean",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Text => "string",
            ParamType::TextList => "string list",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub required: bool,
    pub default: Option<ParamValue>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: Option<&'static [&'static str]>,
    pub description: &'static str,
}

impl ParamSpec {
    fn of(name: &'static str, kind: ParamType) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            allowed: None,
            description: "",
        }
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::of(name, ParamType::Bool)
    }

    pub fn integer(name: &'static str) -> Self {
        Self::of(name, ParamType::Integer)
    }

    pub fn number(name: &'static str) -> Self {
        Self::of(name, ParamType::Number)
    }

    pub fn text(name: &'static str) -> Self {
        Self::of(name, ParamType::Text)
    }

    pub fn text_list(name: &'static str) -> Self {
        Self::of(name, ParamType::TextList)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: ParamValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Inclusive numeric range; for lists, bounds on the list length.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn allowed(mut self, values: &'static [&'static str]) -> Self {
        self.allowed = Some(values);
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    fn check_range(&self, value: f64) -> EchoResult<()> {
        if let Some(min) = self.min {
            if value < min {
                return Err(EchoError::invalid_parameter(self.name, format!("must be >= {min}")));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(EchoError::invalid_parameter(self.name, format!("must be <= {max}")));
            }
        }
        Ok(())
    }

    fn check_allowed(&self, value: &str) -> EchoResult<()> {
        match self.allowed {
            Some(allowed) if !allowed.contains(&value) => Err(EchoError::invalid_parameter(
                self.name,
                format!("`{value}` is not one of {}", allowed.join(", ")),
            )),
            _ => Ok(()),
        }
    }

    /// Coerce `raw` to this parameter's type and check its constraints.
    fn normalize(&self, raw: &ParamValue) -> EchoResult<ParamValue> {
        let mismatch = || {
            EchoError::invalid_parameter(
                self.name,
                format!("expected {}, got {}", self.kind.name(), raw.type_name()),
            )
        };
        let value = match (self.kind, raw) {
            (ParamType::Bool, ParamValue::Bool(b)) => ParamValue::Bool(*b),
            (ParamType::Integer, ParamValue::Integer(i)) => ParamValue::Integer(*i),
            (ParamType::Integer, ParamValue::Number(n)) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                ParamValue::Integer(*n as i64)
            }
            (ParamType::Number, ParamValue::Number(n)) if n.is_finite() => ParamValue::Number(*n),
            (ParamType::Number, ParamValue::Integer(i)) => ParamValue::Number(*i as f64),
            (ParamType::Text, ParamValue::Text(s)) => ParamValue::Text(s.trim().to_string()),
            (ParamType::TextList, ParamValue::List(items)) => {
                ParamValue::List(items.iter().map(|s| s.trim().to_string()).collect())
            }
            (ParamType::TextList, ParamValue::Text(s)) => ParamValue::List(vec![s.trim().to_string()]),
            _ => return Err(mismatch()),
        };

        match &value {
            ParamValue::Integer(i) => self.check_range(*i as f64)?,
            ParamValue::Number(n) => self.check_range(*n)?,
            ParamValue::Text(s) => {
                if s.is_empty() {
                    return Err(EchoError::invalid_parameter(self.name, "must not be empty"));
                }
                self.check_allowed(s)?;
            }
            ParamValue::List(items) => {
                self.check_range(items.len() as f64)?;
                for item in items {
                    if item.is_empty() {
                        return Err(EchoError::invalid_parameter(self.name, "list items must not be empty"));
                    }
                    self.check_allowed(item)?;
                }
            }
            ParamValue::Bool(_) => {}
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    specs: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new(specs: Vec<ParamSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    /// Validate `raw` and fill in defaults. Unknown parameters are rejected.
    pub fn validate(&self, raw: &BTreeMap<String, ParamValue>) -> EchoResult<Params> {
        if let Some(unknown) = raw.keys().find(|k| !self.specs.iter().any(|s| s.name == k.as_str())) {
            return Err(EchoError::invalid_parameter(unknown.as_str(), "unknown parameter"));
        }
        let mut values = BTreeMap::new();
        for spec in &self.specs {
            match (raw.get(spec.name), &spec.default) {
                (Some(v), _) => {
                    values.insert(spec.name.to_string(), spec.normalize(v)?);
                }
                (None, Some(default)) => {
                    values.insert(spec.name.to_string(), default.clone());
                }
                (None, None) if spec.required => {
                    return Err(EchoError::invalid_parameter(spec.name, "is required"));
                }
                (None, None) => {}
            }
        }
        Ok(Params { values })
    }
}

/// Parameters that passed schema validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: BTreeMap<String, ParamValue>,
}

impl Params {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(ParamValue::Bool(true)))
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            ParamValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ParamValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Required text parameter; the schema guarantees presence.
    pub fn require_text(&self, name: &str) -> EchoResult<&str> {
        self.text(name)
            .ok_or_else(|| EchoError::invalid_parameter(name, "is required"))
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        match self.values.get(name)? {
            ParamValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Sorted-key JSON of the validated parameters, defaults included.
    pub fn canonical_json(&self) -> String {
        let object: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    ParamValue::Bool(b) => Value::from(*b),
                    ParamValue::Integer(i) => Value::from(*i),
                    ParamValue::Number(n) => Value::from(*n),
                    ParamValue::Text(s) => Value::from(s.as_str()),
                    ParamValue::List(items) => Value::from(items.clone()),
                };
                (k.clone(), value)
            })
            .collect();
        Value::Object(object).to_string()
    }
}
