//! Hierarchical configuration lookup.
//!
//! # File format
//!
//! ```toml
//! [service]
//! name = "legacyd"
//! program = "/opt/legacy/bin/legacyd"
//!
//! [log]
//! file = "logs/legacyd.log"
//!
//! [options.legacyd]
//! verbose = true
//! port = 9
//! ```
//!
//! Nested tables flatten into dotted section names (`options.legacyd`), and
//! every scalar is kept as its string rendering, in file order. Lookups use a
//! `section/name` key; `section\name` is equivalent and matching ignores ASCII
//! case. A key without a separator addresses the root section.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::tokenize;

/// One flattened table: its dotted name and its scalar entries in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Loaded configuration snapshot. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Config {
    source: Option<PathBuf>,
    sections: Vec<Section>,
}

impl Config {
    /// A configuration with no sections; every lookup returns `None`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load and flatten the TOML file at `path`.
    ///
    /// Returns `ConfigError::NotFound` if absent,
    /// `ConfigError::Parse` (with path + line context) if malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut config = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse configuration text without touching the filesystem.
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let table: toml::Table = toml::from_str(contents)?;
        let mut sections = Vec::new();
        flatten("", &table, &mut sections);
        Ok(Self {
            source: None,
            sections,
        })
    }

    /// Path the configuration was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Find a section by its dotted name, ignoring ASCII case.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|section| section.name.eq_ignore_ascii_case(name))
    }

    /// Look up `section/name` (or `section\name`).
    pub fn get(&self, key: &str) -> Option<&str> {
        let (section, name) = split_key(key);
        self.section(section)?.get(name)
    }

    /// Look up a decimal number. Trailing non-digit characters are an error.
    pub fn get_number(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidNumber {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        trimmed
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber {
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    /// Look up a flag: `true/false`, `yes/no`, `on/off`, `1/0`.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                expected: "a boolean",
            }),
        }
    }

    /// Expand a section into argument tokens: each entry contributes its name
    /// followed by the quote-aware tokens of its value, in file order.
    pub fn section_tokens(&self, name: &str) -> Result<Vec<String>, ConfigError> {
        let Some(section) = self.section(name) else {
            return Ok(Vec::new());
        };
        let mut tokens = Vec::new();
        for (key, value) in &section.entries {
            tokens.push(key.clone());
            let words = tokenize::split(value).map_err(|tokenize::UnterminatedQuote(quote)| {
                ConfigError::UnterminatedQuote {
                    key: format!("{}/{key}", section.name),
                    quote,
                }
            })?;
            tokens.extend(words);
        }
        Ok(tokens)
    }
}

/// Split `section/name` at the last separator; no separator means root.
fn split_key(key: &str) -> (&str, &str) {
    match key.rfind(['/', '\\']) {
        Some(idx) => (&key[..idx], &key[idx + 1..]),
        None => ("", key),
    }
}

fn flatten(prefix: &str, table: &toml::Table, sections: &mut Vec<Section>) {
    let mut entries = Vec::new();
    let mut nested = Vec::new();
    for (key, value) in table {
        match value {
            toml::Value::Table(inner) => nested.push((key, inner)),
            other => entries.push((key.clone(), render_value(other))),
        }
    }

    if !prefix.is_empty() || !entries.is_empty() {
        sections.push(Section {
            name: prefix.to_string(),
            entries,
        });
    }

    for (key, inner) in nested {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        flatten(&name, inner, sections);
    }
}

fn render_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(dt) => dt.to_string(),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| tokenize::quote(&render_value(item)))
            .collect::<Vec<_>>()
            .join(" "),
        toml::Value::Table(table) => table.to_string(),
    }
}
