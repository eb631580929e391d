use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Result, StationLinkError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_path: Option<String>,
}

impl FileAttachment {
    pub fn from_bytes(name: &str, content: &[u8]) -> Self {
        let file_type = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .filter(|ext| !ext.is_empty());
        Self {
            name: Some(name.to_string()),
            file_type,
            encoded_content: Some(BASE64.encode(content)),
            ..Self::default()
        }
    }

    pub fn decoded_content(&self) -> Result<Vec<u8>> {
        let encoded = self.encoded_content.as_deref().unwrap_or_default();
        BASE64
            .decode(encoded)
            .map_err(|e| StationLinkError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub path: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileAttachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Request {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_files(mut self, files: Vec<FileAttachment>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_authentication(mut self, user: &str, password: &str) -> Self {
        self.authentication = Some(Authentication {
            user: user.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Stores a typed body as JSON text.
    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let text = serde_json::to_string(body)
            .map_err(|e| StationLinkError::Serialization(e.to_string()))?;
        self.text = Some(text);
        Ok(self)
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        let text = self
            .text
            .as_deref()
            .ok_or_else(|| StationLinkError::Serialization("request has no body".to_string()))?;
        serde_json::from_str(text).map_err(|e| StationLinkError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileAttachment>>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// One logical unit of the wire protocol.
///
/// Field names on the wire follow the canonical camelCase layout
/// (`syncRequest`, `syncResponse`, `isPingingServer`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_token: Option<String>,
    #[serde(default)]
    pub wait_response: bool,
    #[serde(default)]
    pub split_message: bool,
    #[serde(default)]
    pub message_parts: u32,
    #[serde(default)]
    pub encrypt_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, rename = "isPingingServer")]
    pub is_probe: bool,
    #[serde(default)]
    pub secure_delivery: bool,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_date_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub confirming_delivery: bool,
    #[serde(default, rename = "syncRequest", skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
    #[serde(default, rename = "syncResponse", skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: None,
            to: None,
            validation_token: None,
            wait_response: false,
            split_message: false,
            message_parts: 0,
            encrypt_message: false,
            session_id: None,
            is_probe: false,
            secure_delivery: false,
            message_date_time: None,
            confirming_delivery: false,
            request: None,
            response: None,
        }
    }

    pub fn request(request: Request) -> Self {
        Self {
            request: Some(request),
            ..Self::new()
        }
    }

    pub fn probe() -> Self {
        Self {
            is_probe: true,
            message_date_time: Some(OffsetDateTime::now_utc()),
            ..Self::new()
        }
    }

    /// Announcement preceding `parts` raw continuation frames.
    pub fn split_announcement(parts: u32) -> Self {
        Self {
            split_message: true,
            message_parts: parts,
            ..Self::new()
        }
    }

    pub fn with_target(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_secure_delivery(mut self) -> Self {
        self.secure_delivery = true;
        self
    }

    pub fn target(&self) -> Option<&str> {
        self.to.as_deref().filter(|to| !to.is_empty())
    }

    pub fn path(&self) -> Option<&str> {
        self.request.as_ref().map(|request| request.path.as_str())
    }

    /// A reply to `original`: same id, routing and delivery flags cleared so it
    /// never re-enters forwarding or the durable outbox.
    pub fn reply_to(original: &Envelope, request: Option<Request>, response: Option<Response>) -> Self {
        Self {
            id: original.id.clone(),
            session_id: original.session_id.clone(),
            request,
            response,
            ..Self::new()
        }
    }

    /// Acknowledgment of a secure-delivery envelope, carrying the same id.
    pub fn confirmation_of(original: &Envelope) -> Self {
        Self {
            id: original.id.clone(),
            session_id: original.session_id.clone(),
            secure_delivery: true,
            confirming_delivery: true,
            ..Self::new()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StationLinkError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StationLinkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_canonical() {
        let mut envelope = Envelope::request(Request::new("chatMessage").with_text("hi"));
        envelope.source_id = Some("station-1".to_string());
        envelope.secure_delivery = true;
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["sourceId"], "station-1");
        assert_eq!(value["syncRequest"]["path"], "chatMessage");
        assert_eq!(value["syncRequest"]["text"], "hi");
        assert_eq!(value["secureDelivery"], true);
        assert_eq!(value["isPingingServer"], false);
        assert!(value.get("syncResponse").is_none());
    }

    #[test]
    fn reply_clears_routing_and_delivery_flags() {
        let original = Envelope::request(Request::new("x"))
            .with_target("other")
            .with_secure_delivery();
        let reply = Envelope::reply_to(&original, None, Some(Response::failure("nope")));

        assert_eq!(reply.id, original.id);
        assert!(reply.target().is_none());
        assert!(!reply.secure_delivery);
        assert!(!reply.wait_response);
        assert_eq!(reply.response.unwrap().error_message.as_deref(), Some("nope"));
    }

    #[test]
    fn attachment_and_typed_body() {
        let file = FileAttachment::from_bytes("photo.png", b"\x89PNG");
        assert_eq!(file.file_type.as_deref(), Some("png"));
        assert_eq!(file.decoded_content().unwrap(), b"\x89PNG");

        let request = Request::new("shareFiles")
            .with_body(&serde_json::json!({"count": 2}))
            .unwrap();
        let body: serde_json::Value = request.body().unwrap();
        assert_eq!(body["count"], 2);
    }
}
