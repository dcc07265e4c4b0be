//! Reading objects from YAML manifests.

use std::{
    io::Read as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};
use patchworks_core::Object;
use serde::Deserialize as _;

/// Parses all documents in a (multi-document) YAML stream.
///
/// Empty documents are skipped. Every other document must be a mapping with
/// an `apiVersion`, a `kind` and a `metadata.name`.
pub fn parse_documents(text: &str) -> Result<Vec<Object>> {
    let mut objects = Vec::new();
    for (i, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_json::Value::deserialize(document)
            .with_context(|| format!("parsing document {}", i + 1))?;
        if value.is_null() {
            continue;
        }
        let object = Object::from_value(value).with_context(|| format!("document {}", i + 1))?;
        object
            .key()
            .with_context(|| format!("document {} is not an addressable object", i + 1))?;
        objects.push(object);
    }
    Ok(objects)
}

/// Reads a manifest file, or standard input for `-`.
pub fn read(path: &Path) -> Result<Vec<Object>> {
    let text = if path == PathBuf::from("-") {
        let mut s = String::new();
        std::io::stdin()
            .read_to_string(&mut s)
            .context("reading standard input")?;
        s
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    let objects = parse_documents(&text).with_context(|| format!("in {}", path.display()))?;
    if objects.is_empty() {
        bail!("{} contains no objects", path.display());
    }
    Ok(objects)
}
