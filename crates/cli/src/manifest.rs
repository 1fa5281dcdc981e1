//! Manifest loading and argument parsing helpers.

use anyhow::{anyhow, bail, Context, Result};
use kube::core::DynamicObject;
use serde::Deserialize;
use steward_core::{GroupKind, ObjectRef, TypeRegistry};

fn max_yaml_bytes() -> usize {
    std::env::var("STEWARD_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

/// Read `path` (`-` for stdin) with the size cap applied.
pub fn read_manifest_file(path: &str) -> Result<String> {
    let text = if path == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading manifests from stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?
    };
    let max = max_yaml_bytes();
    if text.len() > max {
        bail!("manifest is {} bytes; limit is {} (STEWARD_MAX_YAML_BYTES)", text.len(), max);
    }
    Ok(text)
}

/// Parse a multi-document YAML stream. Namespaced objects without a namespace get `default_ns`.
pub fn parse_manifests(text: &str, registry: &TypeRegistry, default_ns: &str) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_json::Value::deserialize(doc).with_context(|| format!("document {}: invalid YAML", i))?;
        if value.is_null() {
            continue;
        }
        let mut obj: DynamicObject =
            serde_json::from_value(value).with_context(|| format!("document {}: not a Kubernetes object", i))?;
        let gk = registry.resolve(&obj).with_context(|| format!("document {}", i))?;
        if registry.lookup(&gk)?.namespaced && obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some(default_ns.to_string());
        }
        out.push(obj);
    }
    Ok(out)
}

/// `Kind[.group]/name` for cluster scoped owners, `Kind[.group]/namespace/name` otherwise.
pub fn parse_owner(s: &str) -> Result<ObjectRef> {
    let parts: Vec<&str> = s.split('/').collect();
    let (kind, ns, name) = match parts.as_slice() {
        [kind, name] => (*kind, None, *name),
        [kind, ns, name] => (*kind, Some(*ns), *name),
        _ => bail!("invalid owner {:?} (expect Kind.group/name or Kind.group/namespace/name)", s),
    };
    let gk = GroupKind::parse(kind).ok_or_else(|| anyhow!("invalid owner kind {:?}", kind))?;
    if name.is_empty() {
        bail!("owner {:?} has an empty name", s);
    }
    Ok(ObjectRef::new(&gk, ns, name))
}

pub fn parse_types(types: &[String]) -> Result<Vec<GroupKind>> {
    types
        .iter()
        .map(|t| GroupKind::parse(t).ok_or_else(|| anyhow!("invalid type {:?} (expect Kind or Kind.group)", t)))
        .collect()
}

/// Take the wanted body, keep the live metadata and fold in the wanted labels and annotations.
/// A status the manifest does not set is kept.
pub fn overwrite(current: &DynamicObject, wanted: &DynamicObject) -> Result<DynamicObject> {
    let mut out = current.clone();
    out.data = wanted.data.clone();
    if let (Some(status), Some(body)) = (current.data.get("status"), out.data.as_object_mut()) {
        body.entry("status").or_insert_with(|| status.clone());
    }
    if let Some(labels) = &wanted.metadata.labels {
        out.metadata.labels.get_or_insert_with(Default::default).extend(labels.clone());
    }
    if let Some(annotations) = &wanted.metadata.annotations {
        out.metadata.annotations.get_or_insert_with(Default::default).extend(annotations.clone());
    }
    Ok(out)
}
