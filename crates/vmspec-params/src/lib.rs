// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flat test parameters and the object-scoping conventions layered over them.
//!
//! A [`ParameterSet`] is an ordered list of string keys and string values. Test
//! harnesses scope a parameter to one logical object (an image, a NIC, a
//! memory device) by appending `_<object>` to the key: `image_format_stg`
//! overrides `image_format` when the parameters for object `stg` are
//! requested through [`ParameterSet::object_params`].

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

mod size;

pub use size::parse_size_mib;

/// Errors raised when a parameter is missing or carries a malformed value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("required parameter {key:?} is missing")]
    Missing { key: String },

    #[error("parameter {key:?} has invalid value {value:?} (expected {expected})")]
    Invalid { key: String, value: String, expected: &'static str },
}

impl ParamError {
    pub fn invalid(key: &str, value: &str, expected: &'static str) -> Self {
        Self::Invalid { key: key.to_owned(), value: value.to_owned(), expected }
    }

    pub fn missing(key: &str) -> Self {
        Self::Missing { key: key.to_owned() }
    }
}

/// Errors which may be returned when loading a parameter file.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: expected `key = value`, got {text:?}")]
    Syntax { line: usize, text: String },

    #[error("value of {0} cannot be used as a parameter")]
    UnsupportedValue(String),
}

/// An ordered mapping of parameter names to values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterSet {
    entries: Vec<(String, String)>,
    index: BTreeMap<String, usize>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`. Replacing an existing key keeps its original
    /// position in the iteration order.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&pos| self.entries[pos].1.as_str())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Looks up a parameter that must be present.
    pub fn require(&self, key: &str) -> Result<&str, ParamError> {
        self.get(key).ok_or_else(|| ParamError::missing(key))
    }

    /// Interprets a parameter as a yes/no flag. Absent keys yield `None`.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ParamError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };

        match value.trim().to_ascii_lowercase().as_str() {
            "yes" | "on" | "true" | "1" => Ok(Some(true)),
            "no" | "off" | "false" | "0" => Ok(Some(false)),
            _ => Err(ParamError::invalid(key, value, "yes or no")),
        }
    }

    pub fn get_bool_or(
        &self,
        key: &str,
        default: bool,
    ) -> Result<bool, ParamError> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    /// Parses a parameter as a number. Absent and empty values yield `None`.
    pub fn get_numeric<T: FromStr>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ParamError> {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| ParamError::invalid(key, v, "a number")),
        }
    }

    pub fn get_numeric_or<T: FromStr>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ParamError> {
        Ok(self.get_numeric(key)?.unwrap_or(default))
    }

    /// Parses a memory size in MiB. See [`parse_size_mib`] for the accepted
    /// syntax.
    pub fn get_size_mib(&self, key: &str) -> Result<Option<u64>, ParamError> {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => parse_size_mib(v)
                .map(Some)
                .ok_or_else(|| ParamError::invalid(key, v, "a size in MiB")),
        }
    }

    /// Splits a whitespace-separated object list, e.g. `images = "image1 stg"`.
    pub fn objects(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Returns the parameters as seen by object `name`: every key of the form
    /// `<key>_<name>` overrides `<key>`.
    pub fn object_params(&self, name: &str) -> ParameterSet {
        let suffix = format!("_{name}");
        let mut scoped = self.clone();
        for (key, value) in self.entries.iter() {
            if let Some(base) = key.strip_suffix(suffix.as_str()) {
                if !base.is_empty() {
                    scoped.insert(base, value.as_str());
                }
            }
        }
        scoped
    }

    /// Parses a `a=b,c=d` option string into a map of extra properties.
    pub fn extra_props(
        &self,
        key: &str,
    ) -> Result<BTreeMap<String, String>, ParamError> {
        let mut props = BTreeMap::new();
        let Some(raw) = self.get(key) else {
            return Ok(props);
        };

        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (k, v) = item
                .split_once('=')
                .ok_or_else(|| ParamError::invalid(key, raw, "key=value"))?;
            props.insert(k.trim().to_owned(), v.trim().to_owned());
        }

        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut params = ParameterSet::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Parses `key = value` lines. Blank lines and lines starting with `#` are
/// skipped.
impl FromStr for ParameterSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut params = ParameterSet::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (k, v) = line.split_once('=').ok_or_else(|| {
                ParseError::Syntax { line: idx + 1, text: line.to_owned() }
            })?;
            let k = k.trim();
            if k.is_empty() {
                return Err(ParseError::Syntax {
                    line: idx + 1,
                    text: line.to_owned(),
                });
            }
            params.insert(k, v.trim());
        }
        Ok(params)
    }
}

fn toml_scalar(key: &str, value: &toml::Value) -> Result<String, ParseError> {
    Ok(match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => if *b { "yes" } else { "no" }.to_owned(),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| toml_scalar(key, item))
            .collect::<Result<Vec<_>, _>>()?
            .join(" "),
        _ => return Err(ParseError::UnsupportedValue(key.to_owned())),
    })
}

/// Converts a TOML document into parameters.
///
/// Top-level keys map directly to parameters. A table scopes its keys to an
/// object, so `[stg]` followed by `image_format = "raw"` yields
/// `image_format_stg = raw`. Arrays become whitespace-separated lists.
pub fn from_toml_str(raw: &str) -> Result<ParameterSet, ParseError> {
    let table = toml::from_str::<toml::Table>(raw)?;
    let mut params = ParameterSet::new();
    for (key, value) in table.iter() {
        match value {
            toml::Value::Table(scoped) => {
                for (inner, value) in scoped.iter() {
                    let full = format!("{inner}_{key}");
                    let value = toml_scalar(&full, value)?;
                    params.insert(full, value);
                }
            }
            other => {
                params.insert(key.as_str(), toml_scalar(key, other)?);
            }
        }
    }
    Ok(params)
}

/// Parses a parameter file. Files ending in `.toml` are read as TOML;
/// anything else as `key = value` lines.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<ParameterSet, ParseError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "toml") {
        from_toml_str(&contents)
    } else {
        contents.parse()
    }
}
