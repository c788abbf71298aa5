use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::domain::{BucketId, SyncError};

/// One frame on the session stream. JSON with a `kind` discriminator;
/// parsed once at the edge and handled by match. `state` and `update`
/// payloads are base64 of opaque CRDT bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WireMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeDocument { bucket_id: BucketId, file_path: String },
    #[serde(rename_all = "camelCase")]
    UnsubscribeDocument { bucket_id: BucketId, file_path: String },
    #[serde(rename_all = "camelCase")]
    DocumentState {
        bucket_id: BucketId,
        file_path: String,
        state: String,
    },
    #[serde(rename_all = "camelCase")]
    YjsUpdate {
        bucket_id: BucketId,
        file_path: String,
        update: String,
    },
    #[serde(rename_all = "camelCase")]
    FileTreeChange {
        bucket_id: BucketId,
        file_path: String,
        action: TreeAction,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        bucket_id: Option<BucketId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeAction {
    Create,
    Delete,
}

impl WireMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("wire message serializes")
    }

    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn error_frame(
        err: &SyncError,
        bucket_id: Option<BucketId>,
        file_path: Option<String>,
    ) -> Self {
        WireMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            bucket_id,
            file_path,
        }
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_payload(payload: &str) -> Option<Vec<u8>> {
    BASE64.decode(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_kebab_kinds_and_camel_fields() {
        let bucket = BucketId::new();
        let frame = WireMessage::SubscribeDocument {
            bucket_id: bucket,
            file_path: "main.py".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["kind"], "subscribe-document");
        assert_eq!(json["bucketId"], bucket.to_string());
        assert_eq!(json["filePath"], "main.py");
    }

    #[test]
    fn update_frames_round_trip() {
        let frame = WireMessage::YjsUpdate {
            bucket_id: BucketId::new(),
            file_path: "src/app.py".into(),
            update: encode_payload(&[1, 2, 3]),
        };
        let decoded = WireMessage::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        match decoded {
            WireMessage::YjsUpdate { update, .. } => {
                assert_eq!(decode_payload(&update).unwrap(), vec![1, 2, 3]);
            }
            other => panic!("expected yjs-update, got {other:?}"),
        }
    }

    #[test]
    fn tree_actions_serialize_lowercase() {
        let frame = WireMessage::FileTreeChange {
            bucket_id: BucketId::new(),
            file_path: "old.py".into(),
            action: TreeAction::Delete,
        };
        let json: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["kind"], "file-tree-change");
        assert_eq!(json["action"], "delete");
    }

    #[test]
    fn unknown_kinds_fail_to_decode() {
        assert!(WireMessage::decode(r#"{"kind":"mystery"}"#).is_none());
        assert!(WireMessage::decode("not json").is_none());
    }

    #[test]
    fn error_frames_carry_stable_codes() {
        let frame = WireMessage::error_frame(&SyncError::MalformedUpdate, None, None);
        let json: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["code"], "malformed-update");
        assert!(json.get("bucketId").is_none());
    }
}
