//! Engine-native tables attached to UV and image files.
//!
//! Tables live next to their data file as JSON documents:
//! `<file>.tables/<NAME>.<version>.json`, where spaces in the table name
//! become underscores (`AIPS SN` -> `AIPS_SN`). Column values are lists, as
//! in AIPS tables, even for scalar columns.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorContext, PipelineError, PipelineResult};

pub const INDEX_TABLE: &str = "AIPS NX";
pub const SOLUTION_TABLE: &str = "AIPS SN";
pub const CLEAN_TABLE: &str = "AIPS CC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordType {
    Int,
    Float,
    Double,
    String,
    Bool,
}

/// A table header keyword: type, shape and flattened value list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    #[serde(rename = "type")]
    pub kind: KeywordType,
    pub shape: Vec<usize>,
    pub value: Vec<Value>,
}

impl Keyword {
    pub fn double(v: f64) -> Self {
        Self {
            kind: KeywordType::Double,
            shape: vec![1],
            value: vec![Value::from(v)],
        }
    }

    pub fn int(v: i64) -> Self {
        Self {
            kind: KeywordType::Int,
            shape: vec![1],
            value: vec![Value::from(v)],
        }
    }
}

pub type TableRow = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineTable {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub keywords: BTreeMap<String, Keyword>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
}

impl EngineTable {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            keywords: BTreeMap::new(),
            rows: Vec::new(),
        }
    }

    /// Directory holding the tables of `data_file`.
    pub fn table_dir(data_file: &Path) -> PathBuf {
        let mut name = data_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tables");
        data_file.with_file_name(name)
    }

    pub fn path_for(data_file: &Path, name: &str, version: u32) -> PathBuf {
        Self::table_dir(data_file).join(format!("{}.{}.json", name.replace(' ', "_"), version))
    }

    /// Every version of `name` attached to `data_file`, ascending.
    pub fn versions(data_file: &Path, name: &str) -> Vec<u32> {
        let prefix = format!("{}.", name.replace(' ', "_"));
        let Ok(entries) = std::fs::read_dir(Self::table_dir(data_file)) else {
            return Vec::new();
        };
        let mut versions: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                file_name
                    .strip_prefix(&prefix)?
                    .strip_suffix(".json")?
                    .parse::<u32>()
                    .ok()
            })
            .collect();
        versions.sort_unstable();
        versions
    }

    /// Highest version of `name` attached to `data_file`.
    pub fn latest_version(data_file: &Path, name: &str) -> Option<u32> {
        Self::versions(data_file, name).last().copied()
    }

    /// Copy every version of `name` from `from` onto `to`; returns how many.
    pub fn copy_all(from: &Path, to: &Path, name: &str) -> PipelineResult<usize> {
        let versions = Self::versions(from, name);
        for version in &versions {
            Self::read(from, name, *version)?.write(to)?;
        }
        Ok(versions.len())
    }

    pub fn read(data_file: &Path, name: &str, version: u32) -> PipelineResult<Self> {
        let path = Self::path_for(data_file, name, version);
        let bytes = std::fs::read(&path).map_err(|e| {
            PipelineError::io(e.to_string()).with_context(
                ErrorContext::new("read_table").with_details(path.display().to_string()),
            )
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            PipelineError::format(format!("bad {} table: {}", name, e)).with_context(
                ErrorContext::new("read_table").with_details(path.display().to_string()),
            )
        })
    }

    /// Read the highest version of `name`, failing if none is attached.
    pub fn read_latest(data_file: &Path, name: &str) -> PipelineResult<Self> {
        let version = Self::latest_version(data_file, name).ok_or_else(|| {
            PipelineError::format(format!("no {} table", name)).with_context(
                ErrorContext::new("read_table").with_details(data_file.display().to_string()),
            )
        })?;
        Self::read(data_file, name, version)
    }

    /// Attach this table to `data_file`, replacing the same name and version.
    pub fn write(&self, data_file: &Path) -> PipelineResult<PathBuf> {
        let path = Self::path_for(data_file, &self.name, self.version);
        std::fs::create_dir_all(Self::table_dir(data_file))?;
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn set_keyword(&mut self, key: impl Into<String>, keyword: Keyword) {
        self.keywords.insert(key.into(), keyword);
    }

    pub fn keyword_f64(&self, key: &str) -> Option<f64> {
        self.keywords.get(key)?.value.first()?.as_f64()
    }

    pub fn keyword_f64s(&self, key: &str) -> Vec<f64> {
        self.keywords
            .get(key)
            .map(|k| k.value.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default()
    }
}

/// First value of `column` as a float.
pub fn row_f64(row: &TableRow, column: &str) -> Option<f64> {
    row.get(column)?.first()?.as_f64()
}

/// All values of `column` as floats; missing column yields an empty list.
pub fn row_f64s(row: &TableRow, column: &str) -> Vec<f64> {
    row.get(column)
        .map(|values| values.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// Single-value row cell.
pub fn cell(value: impl Into<Value>) -> Vec<Value> {
    vec![value.into()]
}

/// Remove every table attached to `data_file`.
pub fn remove_tables(data_file: &Path) -> std::io::Result<()> {
    let dir = EngineTable::table_dir(data_file);
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_paths() {
        let p = Path::new("/disk/TARGET.merge.uv");
        assert_eq!(
            EngineTable::path_for(p, "AIPS SN", 2),
            PathBuf::from("/disk/TARGET.merge.uv.tables/AIPS_SN.2.json")
        );
    }

    #[test]
    fn test_write_read_latest() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("img.fits");

        for version in [1, 3, 2] {
            let mut table = EngineTable::new(CLEAN_TABLE, version);
            table.set_keyword("IMRMS", Keyword::double(0.001 * version as f64));
            let mut row = TableRow::new();
            row.insert("FLUX".to_string(), cell(1.5));
            table.rows.push(row);
            table.write(&data).unwrap();
        }

        assert_eq!(EngineTable::latest_version(&data, CLEAN_TABLE), Some(3));
        let table = EngineTable::read_latest(&data, CLEAN_TABLE).unwrap();
        assert_eq!(table.version, 3);
        assert_eq!(table.keyword_f64("IMRMS"), Some(0.003));
        assert_eq!(row_f64(&table.rows[0], "FLUX"), Some(1.5));
        assert!(row_f64s(&table.rows[0], "PARMS").is_empty());
    }

    #[test]
    fn test_copy_all_versions() {
        let dir = tempfile::tempdir().unwrap();
        let uv = dir.path().join("t.mfimage.1.uv");
        let image = dir.path().join("t_clean.fits");
        for version in [2, 1] {
            EngineTable::new(SOLUTION_TABLE, version).write(&uv).unwrap();
        }
        EngineTable::new(INDEX_TABLE, 1).write(&uv).unwrap();

        assert_eq!(EngineTable::versions(&uv, SOLUTION_TABLE), vec![1, 2]);
        assert_eq!(EngineTable::copy_all(&uv, &image, SOLUTION_TABLE).unwrap(), 2);
        assert_eq!(EngineTable::versions(&image, SOLUTION_TABLE), vec![1, 2]);
        assert!(EngineTable::versions(&image, INDEX_TABLE).is_empty());
        assert_eq!(EngineTable::copy_all(&image, &uv, CLEAN_TABLE).unwrap(), 0);
    }

    #[test]
    fn test_missing_table_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineTable::read_latest(&dir.path().join("x.uv"), SOLUTION_TABLE).unwrap_err();
        assert!(matches!(err, PipelineError::Format { .. }));
    }

    #[test]
    fn test_parse_engine_json() {
        let json = r#"{
            "name": "AIPS SN", "version": 1,
            "keywords": {"NO_POL": {"type": "int", "shape": [1], "value": [2]}},
            "rows": [{"TIME": [0.5], "ANTENNA NO.": [3], "REAL1": [1.0], "IMAG1": [0.0]}]
        }"#;
        let table: EngineTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.keyword_f64("NO_POL"), Some(2.0));
        assert_eq!(row_f64(&table.rows[0], "ANTENNA NO."), Some(3.0));
    }
}
