//! Configuration spaces and the configurations drawn from them.
//!
//! A [`ConfigurationSpace`] is an ordered list of parameter definitions. A
//! parameter may carry an activation condition on an earlier parameter, so
//! the set of keys present in a valid [`Configuration`] depends on the values
//! of its parents.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::SpaceError;

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// An immutable assignment of hyperparameter names to values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: BTreeMap<String, ParameterValue>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `name` set to `value`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParameterValue::as_f64)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParameterValue::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParameterValue::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.values.iter()
    }

    /// Entries whose names start with `prefix`, with the prefix stripped.
    pub fn strip_prefix(&self, prefix: &str) -> Configuration {
        let values = self
            .values
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), value.clone()))
            })
            .collect();
        Configuration { values }
    }

    /// All entries with `prefix` prepended to their names.
    pub fn with_prefix(&self, prefix: &str) -> Configuration {
        let values = self
            .values
            .iter()
            .map(|(name, value)| (format!("{prefix}{name}"), value.clone()))
            .collect();
        Configuration { values }
    }

    /// Merge `other` into a copy of `self`; `other` wins on conflicts.
    pub fn merged(mut self, other: &Configuration) -> Configuration {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
        self
    }
}

impl std::fmt::Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "}}")
    }
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    Float { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    Int { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<ParameterValue> },
}

/// Activation condition: the parameter exists only while `parent` takes one
/// of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub parent: String,
    pub values: Vec<ParameterValue>,
}

/// A single parameter dimension in the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub kind: ParameterKind,
    pub default: Option<ParameterValue>,
    pub condition: Option<Condition>,
}

impl ParameterDef {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            condition: None,
        }
    }

    pub fn float(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self::new(name, ParameterKind::Float { low, high })
    }

    pub fn int(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self::new(name, ParameterKind::Int { low, high })
    }

    pub fn log_uniform(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self::new(name, ParameterKind::LogUniform { low, high })
    }

    pub fn choice<V: Into<ParameterValue>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(
            name,
            ParameterKind::Choice {
                values: values.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn with_default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Make this parameter active only while `parent` is one of `values`.
    pub fn active_when<V: Into<ParameterValue>>(
        mut self,
        parent: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.condition = Some(Condition {
            parent: parent.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// The explicit default, or the centre of the range.
    pub fn default_value(&self) -> ParameterValue {
        if let Some(default) = &self.default {
            return default.clone();
        }
        match &self.kind {
            ParameterKind::Float { low, high } => ParameterValue::Float((low + high) / 2.0),
            ParameterKind::Int { low, high } => ParameterValue::Int(low + (high - low) / 2),
            ParameterKind::LogUniform { low, high } => ParameterValue::Float((low * high).sqrt()),
            ParameterKind::Choice { values } => values
                .first()
                .cloned()
                .unwrap_or(ParameterValue::Int(0)),
        }
    }

    fn check_value(&self, value: &ParameterValue) -> Result<(), SpaceError> {
        let invalid = |message: String| SpaceError::InvalidValue {
            name: self.name.clone(),
            message,
        };
        match &self.kind {
            ParameterKind::Float { low, high } | ParameterKind::LogUniform { low, high } => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {value}")))?;
                if !(v >= *low && v <= *high) {
                    return Err(invalid(format!("{v} outside [{low}, {high}]")));
                }
            }
            ParameterKind::Int { low, high } => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| invalid(format!("expected an integer, got {value}")))?;
                if v < *low || v > *high {
                    return Err(invalid(format!("{v} outside [{low}, {high}]")));
                }
            }
            ParameterKind::Choice { values } => {
                if !values.contains(value) {
                    return Err(invalid(format!("{value} is not one of the choices")));
                }
            }
        }
        Ok(())
    }

    fn decode(&self, u: f64) -> ParameterValue {
        let u = if u.is_finite() { u.clamp(0.0, 1.0) } else { 0.5 };
        match &self.kind {
            ParameterKind::Float { low, high } => ParameterValue::Float(low + u * (high - low)),
            ParameterKind::Int { low, high } => {
                let n = (high - low + 1) as f64;
                let offset = ((u * n).floor() as i64).min(high - low);
                ParameterValue::Int(low + offset)
            }
            ParameterKind::LogUniform { low, high } => {
                let (log_low, log_high) = (low.ln(), high.ln());
                ParameterValue::Float((log_low + u * (log_high - log_low)).exp().clamp(*low, *high))
            }
            ParameterKind::Choice { values } => {
                let idx = ((u * values.len() as f64).floor() as usize)
                    .min(values.len().saturating_sub(1));
                values.get(idx).cloned().unwrap_or(ParameterValue::Int(0))
            }
        }
    }

    fn encode(&self, value: &ParameterValue) -> f64 {
        let encoded = match &self.kind {
            ParameterKind::Float { low, high } => {
                value.as_f64().map(|v| (v - low) / (high - low))
            }
            ParameterKind::Int { low, high } => value
                .as_i64()
                .map(|v| ((v - low) as f64 + 0.5) / (high - low + 1) as f64),
            ParameterKind::LogUniform { low, high } => value
                .as_f64()
                .map(|v| (v.ln() - low.ln()) / (high.ln() - low.ln())),
            ParameterKind::Choice { values } => values
                .iter()
                .position(|c| c == value)
                .map(|idx| (idx as f64 + 0.5) / values.len() as f64),
        };
        encoded
            .filter(|u| u.is_finite())
            .map(|u| u.clamp(0.0, 1.0))
            .unwrap_or(0.5)
    }
}

/// The full configuration space: an ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpace {
    pub parameters: Vec<ParameterDef>,
}

impl ConfigurationSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add(mut self, parameter: ParameterDef) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(ParameterDef::float(name, low, high))
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(ParameterDef::int(name, low, high))
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(ParameterDef::log_uniform(name, low, high))
    }

    pub fn add_choice<V: Into<ParameterValue>>(
        self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.add(ParameterDef::choice(name, values))
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    /// Check that the space itself is well formed.
    pub fn validate(&self) -> Result<(), SpaceError> {
        if self.parameters.is_empty() {
            return Err(SpaceError::Empty);
        }
        for (idx, param) in self.parameters.iter().enumerate() {
            let earlier = &self.parameters[..idx];
            if earlier.iter().any(|p| p.name == param.name) {
                return Err(SpaceError::DuplicateParameter {
                    name: param.name.clone(),
                });
            }

            let bad_range = |message: String| SpaceError::InvalidRange {
                name: param.name.clone(),
                message,
            };
            match &param.kind {
                ParameterKind::Float { low, high } => {
                    if !(low.is_finite() && high.is_finite() && low < high) {
                        return Err(bad_range(format!("low {low} must be below high {high}")));
                    }
                }
                ParameterKind::Int { low, high } => {
                    if low > high {
                        return Err(bad_range(format!("low {low} exceeds high {high}")));
                    }
                }
                ParameterKind::LogUniform { low, high } => {
                    if !(*low > 0.0 && high.is_finite() && low < high) {
                        return Err(bad_range(format!(
                            "log range needs 0 < low < high, got [{low}, {high}]"
                        )));
                    }
                }
                ParameterKind::Choice { values } => {
                    if values.is_empty() {
                        return Err(bad_range("no choices".to_string()));
                    }
                }
            }

            if let Some(default) = &param.default {
                param
                    .check_value(default)
                    .map_err(|e| SpaceError::InvalidDefault {
                        name: param.name.clone(),
                        message: e.to_string(),
                    })?;
            }

            if let Some(condition) = &param.condition {
                let parent = earlier
                    .iter()
                    .find(|p| p.name == condition.parent)
                    .ok_or_else(|| SpaceError::InvalidCondition {
                        name: param.name.clone(),
                        parent: condition.parent.clone(),
                    })?;
                for value in &condition.values {
                    parent.check_value(value)?;
                }
            }
        }
        Ok(())
    }

    fn condition_holds(param: &ParameterDef, cfg: &Configuration) -> bool {
        match &param.condition {
            None => true,
            Some(condition) => cfg
                .get(&condition.parent)
                .map(|v| condition.values.contains(v))
                .unwrap_or(false),
        }
    }

    /// Whether `name` should be present in `cfg` given its parents' values.
    pub fn is_active(&self, name: &str, cfg: &Configuration) -> bool {
        self.parameter(name)
            .map(|p| Self::condition_holds(p, cfg))
            .unwrap_or(false)
    }

    /// Check that `cfg` is a valid member of this space.
    pub fn check_configuration(&self, cfg: &Configuration) -> Result<(), SpaceError> {
        if let Some((name, _)) = cfg.iter().find(|(name, _)| self.parameter(name).is_none()) {
            return Err(SpaceError::UnknownParameter { name: name.clone() });
        }
        for param in &self.parameters {
            let active = Self::condition_holds(param, cfg);
            match (active, cfg.get(&param.name)) {
                (true, Some(value)) => param.check_value(value)?,
                (true, None) => {
                    return Err(SpaceError::MissingParameter {
                        name: param.name.clone(),
                    })
                }
                (false, Some(_)) => {
                    return Err(SpaceError::InactiveParameter {
                        name: param.name.clone(),
                    })
                }
                (false, None) => {}
            }
        }
        Ok(())
    }

    /// Defaults for every parameter that is active under the defaults of its
    /// parents.
    pub fn default_configuration(&self) -> Configuration {
        let mut cfg = Configuration::new();
        for param in &self.parameters {
            if Self::condition_holds(param, &cfg) {
                cfg = cfg.with(param.name.clone(), param.default_value());
            }
        }
        cfg
    }

    /// Decode a point of the unit hypercube (one coordinate per parameter,
    /// in definition order). Inactive coordinates are ignored.
    pub fn from_unit_vector(&self, point: &[f64]) -> Configuration {
        let mut cfg = Configuration::new();
        for (idx, param) in self.parameters.iter().enumerate() {
            if Self::condition_holds(param, &cfg) {
                let u = point.get(idx).copied().unwrap_or(0.5);
                cfg = cfg.with(param.name.clone(), param.decode(u));
            }
        }
        cfg
    }

    /// Encode `cfg` into the unit hypercube. Missing or inactive parameters
    /// map to the centre.
    pub fn to_unit_vector(&self, cfg: &Configuration) -> Vec<f64> {
        self.parameters
            .iter()
            .map(|param| {
                cfg.get(&param.name)
                    .map(|value| param.encode(value))
                    .unwrap_or(0.5)
            })
            .collect()
    }

    /// Uniform random configuration.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let point: Vec<f64> = (0..self.parameters.len()).map(|_| rng.gen::<f64>()).collect();
        self.from_unit_vector(&point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model_space() -> ConfigurationSpace {
        ConfigurationSpace::new()
            .add(ParameterDef::choice("model", ["ARX", "MLP"]).with_default("ARX"))
            .add(ParameterDef::int("history", 1, 10).active_when("model", ["ARX"]))
            .add(ParameterDef::log_uniform("lr", 1e-5, 1e-1).active_when("model", ["MLP"]))
            .add_float("gain", 0.0, 2.0)
    }

    #[test]
    fn default_configuration_respects_conditions() {
        let space = model_space();
        space.validate().unwrap();
        let cfg = space.default_configuration();

        assert_eq!(cfg.get_str("model"), Some("ARX"));
        assert_eq!(cfg.get_i64("history"), Some(5));
        assert!(!cfg.contains("lr"));
        assert_eq!(cfg.get_f64("gain"), Some(1.0));
        space.check_configuration(&cfg).unwrap();
    }

    #[test]
    fn validate_rejects_malformed_spaces() {
        assert_eq!(ConfigurationSpace::new().validate(), Err(SpaceError::Empty));

        let inverted = ConfigurationSpace::new().add_float("x", 1.0, 0.0);
        assert!(matches!(inverted.validate(), Err(SpaceError::InvalidRange { .. })));

        let log = ConfigurationSpace::new().add_log_uniform("lr", 0.0, 1.0);
        assert!(matches!(log.validate(), Err(SpaceError::InvalidRange { .. })));

        let dup = ConfigurationSpace::new().add_int("a", 0, 1).add_int("a", 0, 2);
        assert!(matches!(dup.validate(), Err(SpaceError::DuplicateParameter { .. })));

        let forward_ref = ConfigurationSpace::new()
            .add(ParameterDef::int("child", 0, 1).active_when("parent", ["on"]))
            .add_choice("parent", ["on", "off"]);
        assert!(matches!(
            forward_ref.validate(),
            Err(SpaceError::InvalidCondition { .. })
        ));

        let bad_default =
            ConfigurationSpace::new().add(ParameterDef::float("x", 0.0, 1.0).with_default(3.0));
        assert!(matches!(
            bad_default.validate(),
            Err(SpaceError::InvalidDefault { .. })
        ));
    }

    #[test]
    fn check_configuration_flags_inactive_and_missing() {
        let space = model_space();
        let with_inactive = space.default_configuration().with("lr", 0.01);
        assert!(matches!(
            space.check_configuration(&with_inactive),
            Err(SpaceError::InactiveParameter { .. })
        ));

        let missing = Configuration::new().with("model", "MLP").with("gain", 0.5);
        assert!(matches!(
            space.check_configuration(&missing),
            Err(SpaceError::MissingParameter { .. })
        ));

        let unknown = space.default_configuration().with("bogus", 1i64);
        assert!(matches!(
            space.check_configuration(&unknown),
            Err(SpaceError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn samples_are_valid_members() {
        let space = model_space();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let cfg = space.sample(&mut rng);
            space.check_configuration(&cfg).unwrap();
        }
    }

    #[test]
    fn unit_vector_round_trip_keeps_values() {
        let space = model_space();
        let cfg = Configuration::new()
            .with("model", "MLP")
            .with("lr", 1e-3)
            .with("gain", 0.25);
        let decoded = space.from_unit_vector(&space.to_unit_vector(&cfg));
        assert_eq!(decoded.get_str("model"), Some("MLP"));
        assert!((decoded.get_f64("lr").unwrap() - 1e-3).abs() < 1e-12);
        assert!((decoded.get_f64("gain").unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn prefix_helpers() {
        let cfg = Configuration::new().with("ARX:history", 3i64).with("model", "ARX");
        let sub = cfg.strip_prefix("ARX:");
        assert_eq!(sub.len(), 1);
        assert_eq!(sub.get_i64("history"), Some(3));
        assert_eq!(sub.with_prefix("ARX:").get_i64("ARX:history"), Some(3));
    }

    #[test]
    fn configuration_serializes_as_flat_map() {
        let cfg = Configuration::new().with("history", 4i64).with("lr", 0.5).with("model", "ARX");
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(json, r#"{"history":4,"lr":0.5,"model":"ARX"}"#);
        let back: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
