//! Topic manifest
//!
//! Topic-level configuration snapshot uploaded by partition zero's
//! worker whenever the topic configuration changes. JSON only; readers
//! ignore unknown fields.

use coldstream_common::{Error, InitialRevision, Result};
use serde::{Deserialize, Serialize};

/// Topic-level configuration stored next to the partition manifests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicManifest {
    pub namespace: String,
    pub topic: String,
    pub partition_count: u32,
    pub revision: InitialRevision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_ms: Option<u64>,
}

impl TopicManifest {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::ManifestCodec(e.to_string()))
    }

    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::ManifestCodec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_manifest_roundtrip() {
        let manifest = TopicManifest {
            namespace: "kafka".to_string(),
            topic: "events".to_string(),
            partition_count: 12,
            revision: InitialRevision::new(21),
            retention_bytes: Some(1 << 30),
            retention_ms: None,
        };
        let json = manifest.to_json().unwrap();
        let back = TopicManifest::from_json(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = br#"{
            "namespace": "kafka",
            "topic": "events",
            "partition_count": 1,
            "revision": 2,
            "future_field": {"nested": true}
        }"#;
        let manifest = TopicManifest::from_json(json).unwrap();
        assert_eq!(manifest.partition_count, 1);
        assert_eq!(manifest.revision, InitialRevision::new(2));
    }
}
