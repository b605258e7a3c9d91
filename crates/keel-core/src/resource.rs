//! Versioned resources consumed and produced by builds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::PipelineId;

/// Opaque key/value identity of a resource version.
///
/// Keys are kept sorted so two versions with the same pairs compare and
/// serialize identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(BTreeMap<String, String>);

impl Version {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Version {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One name/value pair of version metadata. Order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A resource version as observed within a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedResource {
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub version: Version,
    pub metadata: Vec<MetadataField>,
    pub pipeline_id: PipelineId,
}

/// A versioned resource as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedVersionedResource {
    pub id: i64,
    /// Orders observed versions of the same resource. Opaque to readers.
    pub check_order: i64,
    #[serde(flatten)]
    pub versioned_resource: VersionedResource,
}

/// A versioned resource a build consumed, under the plan's input name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInput {
    pub name: String,
    pub versioned_resource: VersionedResource,
}

/// A versioned resource a build produced.
///
/// `explicit` outputs were declared by the job; implicit ones were only
/// observed. Both are stored, only explicit ones are reported as outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub versioned_resource: VersionedResource,
    pub explicit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_equality_ignores_insertion_order() {
        let a = Version::new().with("ref", "abc").with("branch", "main");
        let b: Version = [("branch", "main"), ("ref", "abc")].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_versioned_resource_uses_type_key() {
        let vr = VersionedResource {
            resource: "repo".to_string(),
            resource_type: "git".to_string(),
            version: Version::new().with("ref", "abc"),
            metadata: vec![MetadataField::new("author", "someone")],
            pipeline_id: PipelineId::new(1),
        };

        let json = serde_json::to_value(&vr).unwrap();
        assert_eq!(json["type"], "git");
        assert_eq!(json["version"]["ref"], "abc");
        assert_eq!(json["metadata"][0]["name"], "author");
    }
}
