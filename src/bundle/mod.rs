//! # Bundles
//!
//! The bundle exchange format: a gzipped tar archive carrying policy
//! sources, data files, and a manifest.
//!
//! Entries:
//! - `manifest.json` - `revision` (opaque string) and `roots` (the
//!   `/`-separated storage paths this bundle owns). A missing manifest
//!   means the bundle owns the whole data tree.
//! - `*.pol` - policy module sources.
//! - `data.json` / `data.yaml` - values placed at the path given by the
//!   file's directory within the archive.
//!
//! Every module package path and every data path must fall under a
//! declared root; otherwise the bundle is rejected. Activation itself
//! (one write transaction swapping data and compiled policy together)
//! is driven by the engine.

use crate::value::Value;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("bundle I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bundle manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("bundle data error in {path}: {message}")]
    Data { path: String, message: String },

    #[error("bundle validation failed: {0}")]
    Validation(String),
}

pub type BundleResult<T> = Result<T, BundleError>;

/// `manifest.json` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// `/`-separated paths this bundle owns. `None` (or an empty list
    /// with no manifest) means the bundle owns everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Vec<String>>,
}

impl Manifest {
    /// Declared roots as path segment lists. The empty path covers the
    /// whole tree.
    pub fn root_paths(&self) -> Vec<Vec<String>> {
        match &self.roots {
            None => vec![Vec::new()],
            Some(roots) if roots.is_empty() => vec![Vec::new()],
            Some(roots) => roots
                .iter()
                .map(|r| {
                    r.split('/')
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .collect(),
        }
    }

    /// Whether `path` lies under at least one declared root.
    pub fn covers(&self, path: &[String]) -> bool {
        self.root_paths()
            .iter()
            .any(|root| path.len() >= root.len() && path.starts_with(root))
    }
}

/// An unpacked bundle.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    pub manifest: Manifest,
    /// (archive path, module source) pairs, in archive order.
    pub modules: Vec<(String, String)>,
    /// Merged data tree assembled from the archive's data files.
    pub data: Value,
}

impl Bundle {
    pub fn new() -> Bundle {
        Bundle {
            manifest: Manifest::default(),
            modules: Vec::new(),
            data: Value::empty_object(),
        }
    }

    /// Read a gzipped tar bundle.
    pub fn read(reader: impl Read) -> BundleResult<Bundle> {
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        let mut bundle = Bundle::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let name = path.trim_start_matches("./").to_string();
            if name.is_empty() || name.ends_with('/') {
                continue;
            }
            let mut content = String::new();
            entry.read_to_string(&mut content)?;

            if name == "manifest.json" {
                bundle.manifest = serde_json::from_str(&content)?;
            } else if name.ends_with(".pol") {
                bundle.modules.push((name, content));
            } else if name.ends_with("data.json") {
                let value = Value::from_json_str(&content).map_err(|e| BundleError::Data {
                    path: name.clone(),
                    message: e.to_string(),
                })?;
                merge_at(&mut bundle.data, &dir_path(&name), value)
                    .map_err(|message| BundleError::Data { path: name, message })?;
            } else if name.ends_with("data.yaml") || name.ends_with("data.yml") {
                let json: serde_json::Value =
                    serde_yaml::from_str(&content).map_err(|e| BundleError::Data {
                        path: name.clone(),
                        message: e.to_string(),
                    })?;
                let value = Value::from_json(&json);
                merge_at(&mut bundle.data, &dir_path(&name), value)
                    .map_err(|message| BundleError::Data { path: name, message })?;
            }
            // Unknown entries (signatures, wasm) are ignored here.
        }
        Ok(bundle)
    }

    /// Write the bundle as a gzipped tar archive.
    pub fn write(&self, writer: impl Write) -> BundleResult<()> {
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let manifest = serde_json::to_vec_pretty(&self.manifest)?;
        append_file(&mut builder, "manifest.json", &manifest)?;

        for (path, source) in &self.modules {
            append_file(&mut builder, path, source.as_bytes())?;
        }

        if self.data.as_object().is_some_and(|m| !m.is_empty()) {
            let json = self
                .data
                .to_json()
                .ok_or_else(|| BundleError::Validation("data tree is not ground".to_string()))?;
            let bytes = serde_json::to_vec_pretty(&json)?;
            append_file(&mut builder, "data.json", &bytes)?;
        }

        builder.into_inner()?.finish()?;
        Ok(())
    }

    /// Validate root coverage: every data path and every module package
    /// path must fall under a declared root.
    pub fn validate(&self, module_packages: &[Vec<String>]) -> BundleResult<()> {
        for package in module_packages {
            if !self.manifest.covers(package) {
                return Err(BundleError::Validation(format!(
                    "module package data.{} is outside the declared roots",
                    package.join(".")
                )));
            }
        }
        if let Value::Object(map) = &self.data {
            for key in map.keys() {
                let path = vec![key
                    .as_str()
                    .ok_or_else(|| {
                        BundleError::Validation("data tree has a non-string key".to_string())
                    })?
                    .to_string()];
                if !self.covers_data_path(&path) {
                    return Err(BundleError::Validation(format!(
                        "data path /{} is outside the declared roots",
                        path.join("/")
                    )));
                }
            }
        }
        Ok(())
    }

    /// A top-level data key is fine if some root covers it or it is a
    /// strict prefix of a root (the bundle owns a subtree below it).
    fn covers_data_path(&self, path: &[String]) -> bool {
        self.manifest.covers(path)
            || self
                .manifest
                .root_paths()
                .iter()
                .any(|root| root.len() > path.len() && root.starts_with(path))
    }
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    content: &[u8],
) -> BundleResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, content)?;
    Ok(())
}

/// Directory of an archive entry as path segments.
fn dir_path(name: &str) -> Vec<String> {
    let mut parts: Vec<String> = name.split('/').map(String::from).collect();
    parts.pop();
    parts
}

/// Deep-merge `value` into `tree` at `path`. Objects merge key-wise;
/// anything else colliding is an error.
fn merge_at(tree: &mut Value, path: &[String], value: Value) -> Result<(), String> {
    let Some((first, rest)) = path.split_first() else {
        return merge_values(tree, value);
    };
    let Value::Object(map) = tree else {
        return Err(format!("cannot merge under non-object at '{first}'"));
    };
    let entry = map
        .entry(Value::String(first.clone()))
        .or_insert_with(Value::empty_object);
    merge_at(entry, rest, value)
}

fn merge_values(target: &mut Value, incoming: Value) -> Result<(), String> {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(new)) => {
            for (k, v) in new {
                match existing.get_mut(&k) {
                    Some(slot) => merge_values(slot, v)?,
                    None => {
                        existing.insert(k, v);
                    }
                }
            }
            Ok(())
        }
        (target @ Value::Object(_), incoming) if target.as_object().is_some_and(|m| m.is_empty()) => {
            *target = incoming;
            Ok(())
        }
        (target, incoming) => Err(format!(
            "conflicting data values: {} vs {}",
            target.type_name(),
            incoming.type_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle() -> Bundle {
        Bundle {
            manifest: Manifest {
                revision: Some("rev-1".to_string()),
                roots: Some(vec!["policies".to_string(), "config".to_string()]),
            },
            modules: vec![(
                "policies/authz.pol".to_string(),
                "package policies.authz\n\nallow = true { input.admin }\n".to_string(),
            )],
            data: Value::from_json_str(r#"{"config":{"limit":10}}"#).unwrap(),
        }
    }

    #[test]
    fn test_round_trip() {
        let bundle = sample_bundle();
        let mut buf = Vec::new();
        bundle.write(&mut buf).unwrap();

        let back = Bundle::read(buf.as_slice()).unwrap();
        assert_eq!(back.manifest.revision.as_deref(), Some("rev-1"));
        assert_eq!(back.modules.len(), 1);
        assert_eq!(back.modules[0].0, "policies/authz.pol");
        assert_eq!(
            back.data,
            Value::from_json_str(r#"{"config":{"limit":10}}"#).unwrap()
        );
    }

    #[test]
    fn test_root_coverage() {
        let manifest = Manifest {
            revision: None,
            roots: Some(vec!["a/b".to_string()]),
        };
        assert!(manifest.covers(&["a".to_string(), "b".to_string(), "c".to_string()]));
        assert!(!manifest.covers(&["a".to_string(), "x".to_string()]));
    }

    #[test]
    fn test_missing_manifest_owns_everything() {
        let manifest = Manifest::default();
        assert!(manifest.covers(&["anything".to_string()]));
    }

    #[test]
    fn test_validate_rejects_out_of_root_module() {
        let bundle = sample_bundle();
        let err = bundle
            .validate(&[vec!["other".to_string(), "pkg".to_string()]])
            .unwrap_err();
        assert!(matches!(err, BundleError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_out_of_root_data() {
        let mut bundle = sample_bundle();
        bundle.data = Value::from_json_str(r#"{"rogue":1}"#).unwrap();
        assert!(bundle.validate(&[]).is_err());
    }

    #[test]
    fn test_validate_accepts_covered_paths() {
        let bundle = sample_bundle();
        bundle
            .validate(&[vec!["policies".to_string(), "authz".to_string()]])
            .unwrap();
    }

    #[test]
    fn test_data_file_placement() {
        // A data file deeper in the archive lands at its directory.
        let mut bundle = Bundle::new();
        bundle.manifest.roots = Some(vec!["x".to_string()]);
        let mut buf = Vec::new();
        {
            let encoder = GzEncoder::new(&mut buf, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_file(&mut builder, "manifest.json", b"{\"roots\":[\"x\"]}").unwrap();
            append_file(&mut builder, "x/data.json", b"{\"limit\": 3}").unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let back = Bundle::read(buf.as_slice()).unwrap();
        assert_eq!(
            back.data,
            Value::from_json_str(r#"{"x":{"limit":3}}"#).unwrap()
        );
    }

    #[test]
    fn test_yaml_data_file() {
        let mut buf = Vec::new();
        {
            let encoder = GzEncoder::new(&mut buf, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_file(&mut builder, "manifest.json", b"{\"roots\":[\"cfg\"]}").unwrap();
            append_file(&mut builder, "cfg/data.yaml", b"limit: 9\nname: prod\n").unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let back = Bundle::read(buf.as_slice()).unwrap();
        assert_eq!(
            back.data,
            Value::from_json_str(r#"{"cfg":{"limit":9,"name":"prod"}}"#).unwrap()
        );
    }
}
