//! JSON Patch operations produced by the patch generator.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

impl PatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Replace => "replace",
            PatchOp::Remove => "remove",
        }
    }
}

/// `{op, path, key, value}`; on the wire the key is folded into the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPatchOp {
    pub op: PatchOp,
    pub path: String,
    pub key: String,
    pub value: Option<serde_json::Value>,
}

/// RFC 6901 escaping for one reference token.
pub fn escape_pointer_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

impl JsonPatchOp {
    pub fn add(path: &str, key: &str, value: impl Into<serde_json::Value>) -> Self {
        Self { op: PatchOp::Add, path: path.to_string(), key: key.to_string(), value: Some(value.into()) }
    }

    pub fn replace(path: &str, key: &str, value: impl Into<serde_json::Value>) -> Self {
        Self { op: PatchOp::Replace, path: path.to_string(), key: key.to_string(), value: Some(value.into()) }
    }

    pub fn remove(path: &str, key: &str) -> Self {
        Self { op: PatchOp::Remove, path: path.to_string(), key: key.to_string(), value: None }
    }

    /// Pin a node write to the version it was computed from. The server answers a stale version
    /// with a conflict instead of applying the rest of the patch.
    pub fn resource_version(rv: &str) -> Self { Self::replace("/metadata", "resourceVersion", rv) }

    pub fn is_resource_version(&self) -> bool { self.path == "/metadata" && self.key == "resourceVersion" }

    /// Full JSON pointer, e.g. `/metadata/labels/example.io~1gpu`.
    pub fn pointer(&self) -> String {
        if self.key.is_empty() {
            self.path.clone()
        } else {
            format!("{}/{}", self.path, escape_pointer_token(&self.key))
        }
    }
}

impl Serialize for JsonPatchOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let n = if self.value.is_some() { 3 } else { 2 };
        let mut m = serializer.serialize_map(Some(n))?;
        m.serialize_entry("op", self.op.as_str())?;
        m.serialize_entry("path", &self.pointer())?;
        if let Some(v) = &self.value {
            m.serialize_entry("value", v)?;
        }
        m.end()
    }
}

/// Convert into the `json_patch` representation used by the kube client and the in-memory store.
pub fn to_json_patch(ops: &[JsonPatchOp]) -> Result<json_patch::Patch, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(ops)?)
}
