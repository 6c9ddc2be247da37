//! Hierarchical output sink.
//!
//! A sink is a tree of groups. Each group carries scalar attributes, numeric
//! datasets and child groups, addressed by `/`-separated paths such as
//! `raw_data/10K - 0.5ps/avg0000`. The whole tree is persisted as one JSON
//! document; missing numeric values (NaN) in datasets are stored as `null`.
//!
//! Measurement files created by the experiment coordinator have four
//! top-level regions:
//!
//! | region     | content                                                |
//! |------------|--------------------------------------------------------|
//! | `raw_data` | one group per coordinate tuple, one table per average   |
//! | `settings` | one group per instrument, its parameters as attributes |
//! | `axes`     | one dataset per sweep dimension                        |
//! | `metadata` | creation date, scan-type tag, measurement name         |

use crate::error::{AppResult, DaqError};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scalar attribute value.
///
/// Stored as the bare JSON scalar. Non-finite floats have no JSON number
/// form and are written as `{"$float": "NaN" | "inf" | "-inf"}` so they
/// read back as floats. Equality treats NaN as equal to NaN, which makes a
/// stored snapshot compare equal to the one it was written from.
#[derive(Debug, Clone)]
pub enum SinkValue {
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Free text
    Text(String),
}

const NON_FINITE_KEY: &str = "$float";

impl PartialEq for SinkValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SinkValue::Bool(a), SinkValue::Bool(b)) => a == b,
            (SinkValue::Int(a), SinkValue::Int(b)) => a == b,
            (SinkValue::Float(a), SinkValue::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (SinkValue::Text(a), SinkValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for SinkValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SinkValue::Bool(b) => serializer.serialize_bool(*b),
            SinkValue::Int(i) => serializer.serialize_i64(*i),
            SinkValue::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            SinkValue::Float(v) => {
                let name = if v.is_nan() {
                    "NaN"
                } else if *v > 0.0 {
                    "inf"
                } else {
                    "-inf"
                };
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(NON_FINITE_KEY, name)?;
                map.end()
            }
            SinkValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for SinkValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SinkValueVisitor)
    }
}

struct SinkValueVisitor;

impl<'de> Visitor<'de> for SinkValueVisitor {
    type Value = SinkValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a bool, number, string or {{\"{NON_FINITE_KEY}\": ...}}")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<SinkValue, E> {
        Ok(SinkValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<SinkValue, E> {
        Ok(SinkValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<SinkValue, E> {
        Ok(i64::try_from(v).map_or(SinkValue::Float(v as f64), SinkValue::Int))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<SinkValue, E> {
        Ok(SinkValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<SinkValue, E> {
        Ok(SinkValue::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<SinkValue, E> {
        Ok(SinkValue::Text(v))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SinkValue, A::Error> {
        let (key, name): (String, String) = map
            .next_entry()?
            .ok_or_else(|| de::Error::custom("empty attribute object"))?;
        if key != NON_FINITE_KEY || map.next_key::<String>()?.is_some() {
            return Err(de::Error::custom(format!(
                "attribute objects hold only \"{NON_FINITE_KEY}\""
            )));
        }
        let value = match name.as_str() {
            "NaN" => f64::NAN,
            "inf" => f64::INFINITY,
            "-inf" => f64::NEG_INFINITY,
            other => {
                return Err(de::Error::custom(format!("unknown non-finite float '{other}'")))
            }
        };
        Ok(SinkValue::Float(value))
    }
}

impl SinkValue {
    /// Numeric view, if the value is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SinkValue::Int(v) => Some(*v as f64),
            SinkValue::Float(v) => Some(*v),
            SinkValue::Bool(_) | SinkValue::Text(_) => None,
        }
    }

    /// Convert a JSON scalar. Arrays and objects have no attribute form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(SinkValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(SinkValue::Int)
                .or_else(|| n.as_f64().map(SinkValue::Float)),
            serde_json::Value::String(s) => Some(SinkValue::Text(s.clone())),
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => None,
        }
    }
}

impl From<f64> for SinkValue {
    fn from(v: f64) -> Self {
        SinkValue::Float(v)
    }
}

impl From<i64> for SinkValue {
    fn from(v: i64) -> Self {
        SinkValue::Int(v)
    }
}

impl From<bool> for SinkValue {
    fn from(v: bool) -> Self {
        SinkValue::Bool(v)
    }
}

impl From<&str> for SinkValue {
    fn from(v: &str) -> Self {
        SinkValue::Text(v.to_string())
    }
}

impl From<String> for SinkValue {
    fn from(v: String) -> Self {
        SinkValue::Text(v)
    }
}

/// Row-major numeric array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dimensions; the product equals `data.len()`
    pub shape: Vec<usize>,
    /// Values, NaN marks missing entries
    #[serde(with = "nan_as_null")]
    pub data: Vec<f64>,
    /// Dataset attributes (units, index column, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, SinkValue>,
}

impl Dataset {
    /// One-dimensional dataset
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
            attrs: BTreeMap::new(),
        }
    }

    /// Two-dimensional dataset from equally long rows
    pub fn matrix(rows: &[Vec<f64>]) -> AppResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(DaqError::Validation(
                "matrix rows must have equal length".into(),
            ));
        }
        Ok(Self {
            shape: vec![rows.len(), cols],
            data: rows.concat(),
            attrs: BTreeMap::new(),
        })
    }

    /// Attach an attribute
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<SinkValue>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// A node of the sink tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Scalar attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, SinkValue>,
    /// Child groups
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Group>,
    /// Datasets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<String, Dataset>,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn split_leaf(path: &str) -> AppResult<(String, &str)> {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, leaf)) if !leaf.is_empty() => Ok((parent.to_string(), leaf)),
        None if !trimmed.is_empty() => Ok((String::new(), trimmed)),
        _ => Err(DaqError::Validation(format!("invalid sink path '{path}'"))),
    }
}

impl Group {
    /// Child group at `path`, if present
    pub fn group(&self, path: &str) -> Option<&Group> {
        segments(path).try_fold(self, |node, name| node.groups.get(name))
    }

    /// Child group at `path`, creating missing groups on the way
    pub fn require_group(&mut self, path: &str) -> &mut Group {
        segments(path).fold(self, |node, name| {
            node.groups.entry(name.to_string()).or_default()
        })
    }

    /// Dataset at `path`, if present
    pub fn dataset(&self, path: &str) -> Option<&Dataset> {
        let (parent, leaf) = split_leaf(path).ok()?;
        self.group(&parent)?.datasets.get(leaf)
    }

    /// Write (or replace) the dataset at `path`, creating parent groups.
    pub fn write_dataset(&mut self, path: &str, dataset: Dataset) -> AppResult<()> {
        let expected: usize = dataset.shape.iter().product();
        if expected != dataset.data.len() {
            return Err(DaqError::Validation(format!(
                "dataset '{path}' has shape {:?} but {} values",
                dataset.shape,
                dataset.data.len()
            )));
        }
        let (parent, leaf) = split_leaf(path)?;
        self.require_group(&parent)
            .datasets
            .insert(leaf.to_string(), dataset);
        Ok(())
    }

    /// Set an attribute on the group at `path`, creating it if needed
    pub fn set_attr(&mut self, path: &str, key: impl Into<String>, value: impl Into<SinkValue>) {
        self.require_group(path)
            .attrs
            .insert(key.into(), value.into());
    }
}

/// A sink tree bound to a file on disk.
#[derive(Debug)]
pub struct SinkFile {
    path: PathBuf,
    root: Group,
}

impl SinkFile {
    /// File extension appended to sink names that lack it.
    pub const EXTENSION: &'static str = "json";

    /// Create an empty sink named `name` in `dir`.
    ///
    /// The extension is appended when missing. The file is written right
    /// away so the name is claimed. Fails with `NameCollision` if the target
    /// exists and `replace` is false.
    pub fn create(dir: impl AsRef<Path>, name: &str, replace: bool) -> AppResult<Self> {
        if name.trim().is_empty() {
            return Err(DaqError::Validation("sink name is empty".into()));
        }
        let dir = dir.as_ref();
        let mut path = dir.join(name);
        if path.extension().and_then(|e| e.to_str()) != Some(Self::EXTENSION) {
            let mut file_name = path.file_name().unwrap_or_default().to_os_string();
            file_name.push(".");
            file_name.push(Self::EXTENSION);
            path.set_file_name(file_name);
        }
        if path.exists() && !replace {
            return Err(DaqError::NameCollision(path));
        }
        fs::create_dir_all(dir)?;
        let sink = Self {
            path,
            root: Group::default(),
        };
        sink.flush()?;
        debug!(path = %sink.path.display(), "created sink");
        Ok(sink)
    }

    /// Open an existing sink
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let text = fs::read_to_string(&path)?;
        let root = serde_json::from_str(&text)?;
        Ok(Self { path, root })
    }

    /// Location on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root group
    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Root group, mutable. Changes reach the disk on [`SinkFile::flush`].
    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    /// Persist the tree. Writes a temporary file and renames it over the target.
    pub fn flush(&self) -> AppResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.root)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|v| if v.is_finite() { Some(*v) } else { None }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let raw: Vec<Option<f64>> = Vec::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_paths_create_groups() {
        let mut root = Group::default();
        root.write_dataset("raw_data/1K - 2ps/avg0000/X", Dataset::vector(vec![1.0, 2.0]))
            .unwrap();
        root.set_attr("metadata", "type", "stepscan");

        assert!(root.group("raw_data/1K - 2ps/avg0000").is_some());
        assert_eq!(
            root.dataset("/raw_data/1K - 2ps/avg0000/X").unwrap().data,
            vec![1.0, 2.0]
        );
        assert_eq!(
            root.group("metadata").unwrap().attrs["type"],
            SinkValue::Text("stepscan".into())
        );
        assert!(root.dataset("raw_data/missing").is_none());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut root = Group::default();
        let bad = Dataset {
            shape: vec![2, 2],
            data: vec![1.0],
            attrs: BTreeMap::new(),
        };
        assert!(matches!(
            root.write_dataset("avg/data", bad),
            Err(DaqError::Validation(_))
        ));
        assert!(root.write_dataset("", Dataset::vector(vec![])).is_err());
    }

    #[test]
    fn file_round_trip_keeps_nan_and_attribute_types() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SinkFile::create(dir.path(), "scan", false).unwrap();
        assert_eq!(sink.path().extension().unwrap(), "json");

        sink.root_mut()
            .write_dataset("all_data/data", Dataset::matrix(&[vec![1.0, f64::NAN]]).unwrap())
            .unwrap();
        sink.root_mut().set_attr("settings/stage", "speed", 2.0);
        sink.root_mut().set_attr("settings/stage", "steps", 7_i64);
        sink.root_mut().set_attr("settings/stage", "enabled", true);
        sink.flush().unwrap();

        let reopened = SinkFile::open(sink.path()).unwrap();
        let data = &reopened.root().dataset("all_data/data").unwrap().data;
        assert_eq!(data[0], 1.0);
        assert!(data[1].is_nan());
        assert_eq!(
            reopened.root().group("settings/stage"),
            sink.root().group("settings/stage")
        );
    }

    #[test]
    fn float_attributes_reopen_bit_for_bit() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let values: Vec<f64> = std::iter::repeat_with(|| f64::from_bits(rng.gen()))
            .filter(|v| v.is_finite())
            .take(5000)
            .chain([1.234_567_889_999_999_9e-23, -0.0, f64::MIN_POSITIVE, f64::MAX])
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let mut sink = SinkFile::create(dir.path(), "floats", false).unwrap();
        for (i, v) in values.iter().enumerate() {
            sink.root_mut().set_attr("settings/dev", format!("p{i:05}"), *v);
        }
        sink.flush().unwrap();

        let reopened = SinkFile::open(sink.path()).unwrap();
        let attrs = &reopened.root().group("settings/dev").unwrap().attrs;
        for (i, v) in values.iter().enumerate() {
            match &attrs[&format!("p{i:05}")] {
                SinkValue::Float(read) => assert_eq!(read.to_bits(), v.to_bits(), "p{i:05}"),
                other => panic!("p{i:05} read back as {other:?}"),
            }
        }
    }

    #[test]
    fn non_finite_attributes_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SinkFile::create(dir.path(), "odd", false).unwrap();
        sink.root_mut().set_attr("settings/lockin", "offset", f64::NAN);
        sink.root_mut().set_attr("settings/lockin", "limit", f64::INFINITY);
        sink.root_mut().set_attr("settings/lockin", "floor", f64::NEG_INFINITY);
        sink.root_mut().set_attr("settings/lockin", "label", "NaN");
        sink.flush().unwrap();

        let reopened = SinkFile::open(sink.path()).unwrap();
        let attrs = &reopened.root().group("settings/lockin").unwrap().attrs;
        assert!(matches!(attrs["offset"], SinkValue::Float(v) if v.is_nan()));
        assert_eq!(attrs["limit"], SinkValue::Float(f64::INFINITY));
        assert_eq!(attrs["floor"], SinkValue::Float(f64::NEG_INFINITY));
        assert_eq!(attrs["label"], SinkValue::Text("NaN".into()));
        assert_eq!(
            reopened.root().group("settings/lockin"),
            sink.root().group("settings/lockin")
        );
    }

    #[test]
    fn unknown_attribute_objects_are_rejected() {
        let err = serde_json::from_str::<SinkValue>(r#"{"$float": "huge"}"#).unwrap_err();
        assert!(err.to_string().contains("huge"));
        assert!(serde_json::from_str::<SinkValue>(r#"{"other": 1}"#).is_err());
        assert_eq!(
            serde_json::from_str::<SinkValue>("7").unwrap(),
            SinkValue::Int(7)
        );
        assert_eq!(
            serde_json::from_str::<SinkValue>("7.0").unwrap(),
            SinkValue::Float(7.0)
        );
    }

    #[test]
    fn existing_file_is_a_name_collision() {
        let dir = tempfile::tempdir().unwrap();
        SinkFile::create(dir.path(), "scan.json", false).unwrap();
        let err = SinkFile::create(dir.path(), "scan", false).unwrap_err();
        assert!(matches!(err, DaqError::NameCollision(_)));
        assert!(SinkFile::create(dir.path(), "scan", true).is_ok());
    }
}
