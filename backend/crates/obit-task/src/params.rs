//! Named task parameters and their Obit parameter-file rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single task parameter value.
///
/// Mirrors the scalar and vector types Obit tasks accept on their inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StrList(Vec<String>),
}

impl ParamValue {
    /// Obit type code used in the parameter file header line.
    fn type_code(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "Boo",
            ParamValue::Int(_) | ParamValue::IntList(_) => "Int",
            ParamValue::Float(_) | ParamValue::FloatList(_) => "Flt",
            ParamValue::Str(_) | ParamValue::StrList(_) => "Str",
        }
    }

    /// Dimension string, e.g. `(1)` for scalars and `(12,2)` for two strings of width 12.
    fn dims(&self) -> String {
        match self {
            ParamValue::Bool(_) | ParamValue::Int(_) | ParamValue::Float(_) => "(1)".to_string(),
            ParamValue::IntList(v) => format!("({})", v.len().max(1)),
            ParamValue::FloatList(v) => format!("({})", v.len().max(1)),
            ParamValue::Str(s) => format!("({},1)", s.len().max(1)),
            ParamValue::StrList(v) => {
                let width = v.iter().map(String::len).max().unwrap_or(1).max(1);
                format!("({},{})", width, v.len().max(1))
            }
        }
    }

    fn render_values(&self, out: &mut String) {
        match self {
            ParamValue::Bool(b) => {
                let _ = writeln!(out, "{}", if *b { "T" } else { "F" });
            }
            ParamValue::Int(i) => {
                let _ = writeln!(out, "{}", i);
            }
            ParamValue::Float(f) => {
                let _ = writeln!(out, "{}", f);
            }
            ParamValue::IntList(v) => {
                let joined: Vec<String> = v.iter().map(|i| i.to_string()).collect();
                let _ = writeln!(out, "{}", joined.join(" "));
            }
            ParamValue::FloatList(v) => {
                let joined: Vec<String> = v.iter().map(|f| f.to_string()).collect();
                let _ = writeln!(out, "{}", joined.join(" "));
            }
            ParamValue::Str(s) => {
                let _ = writeln!(out, "{}", s);
            }
            ParamValue::StrList(v) => {
                for s in v {
                    let _ = writeln!(out, "{}", s);
                }
            }
        }
    }

    /// Parse a literal from an assignment right-hand side.
    ///
    /// Accepts integers, floats, `True`/`False`, quoted strings and
    /// bracketed lists of any of those.
    pub fn parse_literal(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Parse("empty value".to_string()));
        }

        if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let items: Vec<&str> = inner
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            let parsed = items
                .iter()
                .map(|item| Self::parse_literal(item))
                .collect::<Result<Vec<_>>>()?;
            return Self::collect_list(raw, parsed);
        }

        match raw {
            "True" | "true" => return Ok(ParamValue::Bool(true)),
            "False" | "false" => return Ok(ParamValue::Bool(false)),
            _ => {}
        }

        if let Some(s) = strip_quotes(raw) {
            return Ok(ParamValue::Str(s.to_string()));
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Ok(ParamValue::Int(i));
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Ok(ParamValue::Float(f));
        }

        Err(Error::Parse(format!("unrecognised literal '{}'", raw)))
    }

    fn collect_list(raw: &str, items: Vec<ParamValue>) -> Result<Self> {
        if items.iter().all(|v| matches!(v, ParamValue::Int(_))) {
            let ints = items
                .into_iter()
                .filter_map(|v| match v {
                    ParamValue::Int(i) => Some(i),
                    _ => None,
                })
                .collect();
            return Ok(ParamValue::IntList(ints));
        }
        if items
            .iter()
            .all(|v| matches!(v, ParamValue::Int(_) | ParamValue::Float(_)))
        {
            let floats = items
                .into_iter()
                .filter_map(|v| match v {
                    ParamValue::Int(i) => Some(i as f64),
                    ParamValue::Float(f) => Some(f),
                    _ => None,
                })
                .collect();
            return Ok(ParamValue::FloatList(floats));
        }
        if items.iter().all(|v| matches!(v, ParamValue::Str(_))) {
            let strs = items
                .into_iter()
                .filter_map(|v| match v {
                    ParamValue::Str(s) => Some(s),
                    _ => None,
                })
                .collect();
            return Ok(ParamValue::StrList(strs));
        }
        Err(Error::Parse(format!("mixed-type list '{}'", raw)))
    }
}

fn strip_quotes(raw: &str) -> Option<&str> {
    raw.strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        ParamValue::FloatList(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::StrList(v)
    }
}

impl std::fmt::Display for ParamValue {
    /// Assignment-style rendering, the inverse of [`ParamValue::parse_literal`].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn list<T: std::fmt::Display>(f: &mut std::fmt::Formatter<'_>, items: &[T]) -> std::fmt::Result {
            let joined: Vec<String> = items.iter().map(|i| i.to_string()).collect();
            write!(f, "[{}]", joined.join(", "))
        }
        match self {
            ParamValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{:?}", x),
            ParamValue::Str(s) => write!(f, "'{}'", s),
            ParamValue::IntList(v) => list(f, v),
            ParamValue::FloatList(v) => {
                let joined: Vec<String> = v.iter().map(|x| format!("{:?}", x)).collect();
                write!(f, "[{}]", joined.join(", "))
            }
            ParamValue::StrList(v) => {
                let quoted: Vec<String> = v.iter().map(|s| format!("'{}'", s)).collect();
                list(f, &quoted)
            }
        }
    }
}

/// Ordered set of named task parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    values: BTreeMap<String, ParamValue>,
}

impl TaskParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Builder-style variant of [`TaskParams::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ParamValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// Overlay `other` on top of these parameters; `other` wins on conflicts.
    pub fn merge(&mut self, other: &TaskParams) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Parse `"FOV=1.0; chAvg=8; Sources=['A','B']"` style assignments.
    ///
    /// Empty input yields an empty set. Parameter names must be identifiers.
    pub fn parse_assignments(input: &str) -> Result<Self> {
        let mut params = TaskParams::new();
        for stmt in split_statements(input) {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            let (name, value) = stmt
                .split_once('=')
                .ok_or_else(|| Error::Parse(format!("'{}' is not an assignment", stmt)))?;
            let name = name.trim();
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::InvalidParameter(format!(
                    "'{}' is not a valid parameter name",
                    name
                )));
            }
            params.set(name, ParamValue::parse_literal(value)?);
        }
        Ok(params)
    }

    /// Render as an Obit parameter file.
    ///
    /// Each entry is a `$Key = <name> <type> <dims>` line followed by its value lines.
    pub fn to_parameter_file(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.values {
            let _ = writeln!(
                out,
                "$Key = {} {} {}",
                name,
                value.type_code(),
                value.dims()
            );
            value.render_values(&mut out);
        }
        out
    }
}

/// Split on `;` outside brackets and quotes.
fn split_statements(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth -= 1,
            (None, ';') if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignments_mixed_types() {
        let params =
            TaskParams::parse_assignments("FOV=1.2; Niter=5000; Sources=['3C286', 'PKS 1934']; doCalib=True")
                .unwrap();
        assert_eq!(params.get_f64("FOV"), Some(1.2));
        assert_eq!(params.get_i64("Niter"), Some(5000));
        assert_eq!(
            params.get("Sources"),
            Some(&ParamValue::StrList(vec![
                "3C286".to_string(),
                "PKS 1934".to_string()
            ]))
        );
        assert_eq!(params.get("doCalib"), Some(&ParamValue::Bool(true)));
    }

    #[test]
    fn test_parse_assignments_empty() {
        assert!(TaskParams::parse_assignments("").unwrap().is_empty());
        assert!(TaskParams::parse_assignments(" ; ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_assignments_rejects_garbage() {
        assert!(TaskParams::parse_assignments("FOV").is_err());
        assert!(TaskParams::parse_assignments("F O V=1").is_err());
        assert!(TaskParams::parse_assignments("FOV=[1, 'a']").is_err());
    }

    #[test]
    fn test_numeric_list_promotes_to_float() {
        let value = ParamValue::parse_literal("[1, 2.5]").unwrap();
        assert_eq!(value, ParamValue::FloatList(vec![1.0, 2.5]));
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = TaskParams::new().with("FOV", 1.0).with("chAvg", 8i64);
        let overrides = TaskParams::parse_assignments("chAvg=4").unwrap();
        base.merge(&overrides);
        assert_eq!(base.get_i64("chAvg"), Some(4));
        assert_eq!(base.get_f64("FOV"), Some(1.0));
    }

    #[test]
    fn test_parameter_file_rendering() {
        let params = TaskParams::new()
            .with("FOV", 1.0)
            .with("inName", "target")
            .with("doCalib", false);
        let text = params.to_parameter_file();
        assert!(text.contains("$Key = FOV Flt (1)\n1\n"));
        assert!(text.contains("$Key = inName Str (6,1)\ntarget\n"));
        assert!(text.contains("$Key = doCalib Boo (1)\nF\n"));
    }

    #[test]
    fn test_display_parses_back() {
        for value in [
            ParamValue::Float(1.0),
            ParamValue::Int(8),
            ParamValue::Bool(true),
            ParamValue::Str("wide_L".to_string()),
            ParamValue::StrList(vec!["A".to_string(), "B".to_string()]),
        ] {
            assert_eq!(ParamValue::parse_literal(&value.to_string()).unwrap(), value);
        }
    }
}
