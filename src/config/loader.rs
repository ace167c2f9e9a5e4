//! Configuration file loading and saving.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::StoreError;
use crate::paths;
use crate::node::{is_reserved, Node, Value, DATA_KEY, TYPE_HINTS_KEY};

/// Keys starting with this prefix are never loaded from a legacy flat file.
const SYSTEM_PREFIX: &str = "__";

/// Contents of a configuration file: the data tree plus per-path type hints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub data: Node,
    pub type_hints: BTreeMap<String, String>,
}

impl Document {
    /// A document from a tree and its type hints.
    pub fn new(data: Node, type_hints: BTreeMap<String, String>) -> Self {
        Self { data, type_hints }
    }

    /// Interprets a parsed YAML document.
    ///
    /// Files with a `__data__` section use the sectioned layout; anything else
    /// is a legacy flat layout with system-prefixed keys skipped.
    pub fn from_yaml(root: serde_yaml::Value) -> Result<Self, String> {
        let mapping = match root {
            serde_yaml::Value::Null => return Ok(Document::default()),
            serde_yaml::Value::Mapping(mapping) => mapping,
            other => {
                return Err(format!(
                    "top level must be a mapping, found {}",
                    yaml_kind(&other)
                ))
            }
        };

        let data_key = serde_yaml::Value::from(DATA_KEY);
        let Some(data_section) = mapping.get(&data_key) else {
            return Ok(Document {
                data: flat_node(&mapping),
                type_hints: BTreeMap::new(),
            });
        };

        let mut data = match Value::from_yaml(data_section.clone()) {
            Value::Node(node) => node,
            Value::Null => Node::new(),
            other => return Err(format!("'{}' must be a mapping, found {:?}", DATA_KEY, other)),
        };

        // Top-level keys next to the sections are kept unless the data section
        // already defines them.
        for (key, value) in flat_node(&mapping).iter() {
            if !data.contains_key(key) {
                data.insert_raw(key.to_string(), value.clone());
            }
        }

        let type_hints = mapping
            .get(&serde_yaml::Value::from(TYPE_HINTS_KEY))
            .map(type_hints_from_yaml)
            .unwrap_or_default();

        Ok(Document { data, type_hints })
    }

    /// Renders the sectioned layout.
    pub fn to_yaml(&self) -> serde_yaml::Value {
        let mut hints = serde_yaml::Mapping::new();
        for (path, hint) in &self.type_hints {
            hints.insert(path.as_str().into(), hint.as_str().into());
        }

        let mut root = serde_yaml::Mapping::new();
        root.insert(DATA_KEY.into(), serde_yaml::Value::Mapping(self.data.to_mapping()));
        root.insert(TYPE_HINTS_KEY.into(), serde_yaml::Value::Mapping(hints));
        serde_yaml::Value::Mapping(root)
    }
}

fn flat_node(mapping: &serde_yaml::Mapping) -> Node {
    let mut node = Node::new();
    for (key, value) in mapping {
        let Some(key) = key.as_str() else { continue };
        if key.starts_with(SYSTEM_PREFIX) || is_reserved(key) {
            continue;
        }
        node.insert_raw(key.to_string(), Value::from_yaml(value.clone()));
    }
    node
}

fn type_hints_from_yaml(section: &serde_yaml::Value) -> BTreeMap<String, String> {
    let Some(mapping) = section.as_mapping() else {
        return BTreeMap::new();
    };
    mapping
        .iter()
        .filter_map(|(path, hint)| {
            let path = path.as_str()?;
            let hint = match hint {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Null => return None,
                other => Value::from_yaml(other.clone()).to_string(),
            };
            Some((path.to_string(), hint))
        })
        .collect()
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a sequence",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

/// Reads and writes configuration documents.
///
/// A failed load must leave the file untouched; `save` writes the whole
/// document so readers never observe a partial file.
#[cfg_attr(test, mockall::automock)]
pub trait Persistence: Send + Sync {
    fn load(&self, path: &Path) -> Result<Document, StoreError>;

    fn save(&self, path: &Path, document: &Document) -> Result<(), StoreError>;
}

/// YAML files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlFile;

impl Persistence for YamlFile {
    fn load(&self, path: &Path) -> Result<Document, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let content = fix_windows_paths(&content);
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| StoreError::ParseFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Document::from_yaml(parsed).map_err(|message| StoreError::ParseFailed {
            path: path.to_path_buf(),
            message,
        })
    }

    fn save(&self, path: &Path, document: &Document) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(&document.to_yaml())
            .map_err(|e| StoreError::SerializeFailed(e.to_string()))?;
        write_atomic(path, yaml.as_bytes())
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        paths::ensure_dir(parent)?;
    }

    let tmp = temp_path(path);
    fs::write(&tmp, bytes).map_err(|e| StoreError::WriteFailed {
        path: tmp.clone(),
        source: e,
    })?;

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Rewrites double-quoted Windows paths with forward slashes.
///
/// `"C:\new\table"` is otherwise read with `\n` and `\t` escapes. Only drive
/// letters (`C:\`), relative prefixes (`.\`, `..\`) and UNC shares
/// (`\\host\share`) qualify, so escapes such as `"\t"` or `"\e[31m"` that
/// serde_yaml writes for control characters are left alone.
fn fix_windows_paths(content: &str) -> Cow<'_, str> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#""((?:[a-zA-Z]:\\|\.\.?\\|\\\\[\w.$-]+\\[\w.$-])[^"]*)""#).ok()
    });
    let Some(pattern) = pattern else {
        return Cow::Borrowed(content);
    };
    pattern.replace_all(content, |caps: &Captures<'_>| {
        format!("\"{}\"", caps[1].replace("\\\\", "/").replace('\\', "/"))
    })
}
