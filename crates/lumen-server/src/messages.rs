//! Wire messages of the ingestion session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const METADATA_TYPE: &str = "metadata";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Status {
        message: String,
    },
    Progress {
        progress: u8,
        received: u64,
        total: u64,
        message: String,
    },
    Success {
        data: UploadSummary,
        message: String,
    },
    Error {
        error: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn status(message: impl Into<String>) -> Self {
        ServerMessage::Status {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub uploaded_at: String,
    pub status: &'static str,
    pub vision_result: Option<VisionReport>,
}

/// Inference outcome as reported to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<MaskReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskReport {
    pub staged: bool,
    pub committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Declared intent carried by the first client message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, rename = "contentType")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataParseError {
    InvalidJson,
    NotMetadata,
    InvalidFields(String),
}

impl MetadataParseError {
    pub fn message(&self) -> String {
        match self {
            MetadataParseError::InvalidJson => "Invalid JSON in metadata".to_string(),
            MetadataParseError::NotMetadata => "Expected metadata message first".to_string(),
            MetadataParseError::InvalidFields(detail) => format!("Invalid metadata: {detail}"),
        }
    }
}

pub fn parse_metadata(text: &str) -> Result<FileMetadata, MetadataParseError> {
    let value: Value = serde_json::from_str(text).map_err(|_| MetadataParseError::InvalidJson)?;
    if value.get("type").and_then(Value::as_str) != Some(METADATA_TYPE) {
        return Err(MetadataParseError::NotMetadata);
    }
    serde_json::from_value(value)
        .map_err(|error| MetadataParseError::InvalidFields(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_requires_type_discriminator() {
        let parsed = parse_metadata(
            r#"{"type":"metadata","filename":"a.png","size":12,"contentType":"image/png"}"#,
        )
        .expect("metadata parses");
        assert_eq!(parsed.filename.as_deref(), Some("a.png"));
        assert_eq!(parsed.size, Some(12));
        assert_eq!(parsed.content_type.as_deref(), Some("image/png"));

        assert_eq!(
            parse_metadata(r#"{"type":"chunk"}"#),
            Err(MetadataParseError::NotMetadata)
        );
        assert_eq!(
            parse_metadata("not json"),
            Err(MetadataParseError::InvalidJson)
        );
        assert!(matches!(
            parse_metadata(r#"{"type":"metadata","size":-1}"#),
            Err(MetadataParseError::InvalidFields(_))
        ));
    }

    #[test]
    fn server_messages_use_type_discriminator() {
        let progress = ServerMessage::Progress {
            progress: 25,
            received: 50,
            total: 200,
            message: "Received 50 of 200 bytes (25%)".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&progress).expect("serializes"),
            json!({
                "type": "progress",
                "progress": 25,
                "received": 50,
                "total": 200,
                "message": "Received 50 of 200 bytes (25%)"
            })
        );

        let error = ServerMessage::Error {
            error: "protocol".to_string(),
            message: "Expected metadata message first".to_string(),
        };
        let value = serde_json::to_value(&error).expect("serializes");
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "protocol");
    }

    #[test]
    fn summary_fields_are_camel_case() {
        let summary = UploadSummary {
            id: "abc".to_string(),
            url: "/files/abc/report/a.png".to_string(),
            filename: "a.png".to_string(),
            size: 3,
            content_type: "image/png".to_string(),
            uploaded_at: "2024-01-01T00:00:00+00:00".to_string(),
            status: "processed",
            vision_result: None,
        };
        let value = serde_json::to_value(&summary).expect("serializes");
        assert_eq!(value["contentType"], "image/png");
        assert_eq!(value["uploadedAt"], "2024-01-01T00:00:00+00:00");
        assert!(value["visionResult"].is_null());
    }
}
