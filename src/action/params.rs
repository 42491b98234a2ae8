//! Typed Action Parameters
//!
//! Actions declare their default parameters as text, one per line:
//!
//! ```text
//! log_value : debug_string : str
//! return_false : False : bool
//! size : small : small, big, HUGE
//! ```
//!
//! The type is one of `str` (or `unicode`), `int`, `float`, `bool`, or a
//! comma-separated member list declaring an enumeration. Block parameters
//! given as raw text are cast to the type of the matching default.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::error::SequenceError;
use crate::sequence::model::parse_bool;

/// Errors raised while parsing or casting parameter values.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParamError {
    #[error("'{0}' is not a valid bool")]
    InvalidBool(String),

    #[error("'{0}' is not a valid int")]
    InvalidInt(String),

    #[error("'{0}' is not a valid float")]
    InvalidFloat(String),

    #[error("'{value}' not in {members:?}")]
    NotAMember { value: String, members: Vec<String> },

    #[error("Unknown parameter type '{0}'")]
    UnknownType(String),

    #[error("Malformed parameter line '{0}'")]
    MalformedLine(String),
}

/// A value restricted to a closed set of members.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    value: String,
    members: Vec<String>,
}

impl EnumValue {
    /// Creates an enumeration value, checking membership.
    pub fn new(value: &str, members: &[String]) -> Result<Self, ParamError> {
        let value = value.trim();
        if !members.iter().any(|m| m == value) {
            return Err(ParamError::NotAMember {
                value: value.to_string(),
                members: members.to_vec(),
            });
        }
        Ok(Self {
            value: value.to_string(),
            members: members.to_vec(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl Serialize for EnumValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

/// A typed parameter value.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Enum(EnumValue),
}

impl ParamValue {
    /// Casts raw text to the type of this value.
    pub fn coerce(&self, text: &str) -> Result<ParamValue, ParamError> {
        match self {
            Self::Str(_) => Ok(Self::Str(text.to_string())),
            Self::Int(_) => text
                .trim()
                .parse()
                .map(Self::Int)
                .map_err(|_| ParamError::InvalidInt(text.to_string())),
            Self::Float(_) => text
                .trim()
                .parse()
                .map(Self::Float)
                .map_err(|_| ParamError::InvalidFloat(text.to_string())),
            Self::Bool(_) => parse_bool(text)
                .map(Self::Bool)
                .ok_or_else(|| ParamError::InvalidBool(text.to_string())),
            Self::Enum(e) => EnumValue::new(text, e.members()).map(Self::Enum),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Enum(_) => "enum",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Enum(e) => write!(f, "{}", e),
        }
    }
}

/// Parses a value given its textual type.
pub fn parse_value(value: &str, vtype: &str) -> Result<ParamValue, ParamError> {
    let vtype = vtype.trim();
    if vtype.contains(',') {
        let members: Vec<String> = vtype.split(',').map(|m| m.trim().to_string()).collect();
        return EnumValue::new(value, &members).map(ParamValue::Enum);
    }
    let prototype = match vtype.to_lowercase().as_str() {
        "str" | "unicode" => ParamValue::Str(String::new()),
        "int" => ParamValue::Int(0),
        "float" => ParamValue::Float(0.0),
        "bool" => ParamValue::Bool(false),
        _ => return Err(ParamError::UnknownType(vtype.to_string())),
    };
    prototype.coerce(value.trim())
}

/// Parses the default parameter text of an action.
pub fn parse_default_parameters(text: &str) -> Result<ParameterSet, ParamError> {
    let mut set = ParameterSet::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(':').map(str::trim).collect();
        match parts.as_slice() {
            [name, value, vtype] if !name.is_empty() => {
                set.insert(*name, parse_value(value, vtype)?);
            }
            _ => return Err(ParamError::MalformedLine(line.to_string())),
        }
    }
    Ok(set)
}

/// Ordered set of named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: Vec<(String, ParamValue)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter, keeping its position if it already exists.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParamValue::Str(s) => Some(s.as_str()),
            ParamValue::Enum(e) => Some(e.as_str()),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            ParamValue::Float(x) => Some(*x),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl Serialize for ParameterSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Casts the raw parameters of an action block against its defaults.
///
/// Parameters absent from the block keep their default value.
pub fn resolve_parameters(
    block_id: &str,
    defaults: &ParameterSet,
    raw: &BTreeMap<String, String>,
) -> Result<ParameterSet, SequenceError> {
    let mut result = defaults.clone();
    for (name, text) in raw {
        let default = defaults.get(name).ok_or_else(|| {
            SequenceError::action(format!(
                "Action '{}' has no parameters called '{}'",
                block_id, name
            ))
        })?;
        let value = default.coerce(text).map_err(|_| {
            SequenceError::action(format!(
                "Error while casting parameters '{}' of action '{}'",
                name, block_id
            ))
        })?;
        result.insert(name.as_str(), value);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "
        param_1 : default_string : unicode
        param_2 : 3.14 : float
        param_3 : 42 : int
        param_4 : small: small, big, HUGE
        flag : False : bool
    ";

    #[test]
    fn test_parse_default_parameters() {
        let set = parse_default_parameters(TEXT).unwrap();
        assert_eq!(set.names(), vec!["param_1", "param_2", "param_3", "param_4", "flag"]);
        assert_eq!(set.get_str("param_1"), Some("default_string"));
        assert_eq!(set.get_float("param_2"), Some(3.14));
        assert_eq!(set.get_int("param_3"), Some(42));
        assert_eq!(set.get_str("param_4"), Some("small"));
        assert_eq!(set.get_bool("flag"), Some(false));

        match set.get("param_4").unwrap() {
            ParamValue::Enum(e) => assert_eq!(e.members(), ["small", "big", "HUGE"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_default_parameters("name : value"),
            Err(ParamError::MalformedLine(_))
        ));
        assert!(matches!(
            parse_default_parameters("x : 1 : complex"),
            Err(ParamError::UnknownType(_))
        ));
        assert!(parse_default_parameters("x : small : big, HUGE").is_err());
    }

    #[test]
    fn test_bool_coercion() {
        let proto = ParamValue::Bool(false);
        for (text, expected) in [("true", true), ("1", true), ("FALSE", false), ("0", false)] {
            assert_eq!(proto.coerce(text).unwrap(), ParamValue::Bool(expected));
        }
        assert_eq!(
            proto.coerce("yes"),
            Err(ParamError::InvalidBool("yes".to_string()))
        );
    }

    #[test]
    fn test_enum_membership() {
        let members = vec!["small".to_string(), "big".to_string()];
        assert!(EnumValue::new("big", &members).is_ok());
        let err = EnumValue::new("huge", &members).unwrap_err();
        assert!(err.to_string().contains("huge"));
    }

    #[test]
    fn test_resolve_parameters() {
        let defaults = parse_default_parameters(TEXT).unwrap();
        let mut raw = BTreeMap::new();
        raw.insert("param_3".to_string(), "7".to_string());
        raw.insert("param_4".to_string(), "HUGE".to_string());
        raw.insert("flag".to_string(), "1".to_string());

        let set = resolve_parameters("act", &defaults, &raw).unwrap();
        assert_eq!(set.get_int("param_3"), Some(7));
        assert_eq!(set.get_str("param_4"), Some("HUGE"));
        assert_eq!(set.get_bool("flag"), Some(true));
        assert_eq!(set.get_str("param_1"), Some("default_string"));
        // order follows the defaults
        assert_eq!(set.names(), defaults.names());
    }

    #[test]
    fn test_resolve_unknown_parameter() {
        let defaults = parse_default_parameters(TEXT).unwrap();
        let mut raw = BTreeMap::new();
        raw.insert("colour".to_string(), "red".to_string());
        let err = resolve_parameters("act", &defaults, &raw).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Action creation error: Action 'act' has no parameters called 'colour'"
        );
    }

    #[test]
    fn test_resolve_cast_failure() {
        let defaults = parse_default_parameters(TEXT).unwrap();
        for (name, text) in [("param_3", "4.5"), ("param_4", "tiny"), ("flag", "maybe")] {
            let mut raw = BTreeMap::new();
            raw.insert(name.to_string(), text.to_string());
            let err = resolve_parameters("act", &defaults, &raw).unwrap_err();
            assert!(err.to_string().contains("Error while casting parameters"));
        }
    }

    #[test]
    fn test_serialize_parameter_set() {
        let set = parse_default_parameters(TEXT).unwrap();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["param_3"], 42);
        assert_eq!(json["param_4"], "small");
        assert_eq!(json["flag"], false);
    }
}
