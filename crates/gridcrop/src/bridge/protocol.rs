//! Wire protocol types for client-worker communication.
//!
//! One request/response pair per action:
//! - **post-img**: register (or replace) the image behind a handle
//! - **post-config**: register (or replace) the extraction config for a handle
//! - **extract-box**: crop and encode one box of the current config
//!
//! Responses carry the request's `reqId` and may arrive in any order. Binary
//! payloads are base64 strings inside the JSON document.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::geometry::ExtractConfig;

/// Opaque image identifier shared by both sides of the channel.
///
/// Assigned by the client, never reused within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageHandle(u64);

impl ImageHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "img-{}", self.0)
    }
}

/// Correlates one response with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Owned binary payload, base64 on the wire.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Blob(Vec<u8>);

impl Blob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Where the worker gets an image from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Encoded image bytes (PNG, JPEG, ...).
    Bytes(Blob),
    /// URL or filesystem path, fetched by the worker.
    Locator(String),
}

impl ImageSource {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Blob::new(bytes.into()))
    }

    pub fn locator(locator: impl Into<String>) -> Self {
        Self::Locator(locator.into())
    }
}

/// Action kinds, used as half of the pending-request key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    PostImg,
    PostConfig,
    ExtractBox,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PostImg => "post-img",
            Self::PostConfig => "post-config",
            Self::ExtractBox => "extract-box",
        })
    }
}

/// Messages from client to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    PostImg {
        img_id: ImageHandle,
        req_id: RequestId,
        img: ImageSource,
    },

    #[serde(rename_all = "camelCase")]
    PostConfig {
        img_id: ImageHandle,
        req_id: RequestId,
        config: ExtractConfig,
    },

    /// Only the handle and index travel; the config is already cached.
    #[serde(rename_all = "camelCase")]
    ExtractBox {
        img_id: ImageHandle,
        req_id: RequestId,
        idx: usize,
    },
}

impl Request {
    pub fn action(&self) -> Action {
        match self {
            Self::PostImg { .. } => Action::PostImg,
            Self::PostConfig { .. } => Action::PostConfig,
            Self::ExtractBox { .. } => Action::ExtractBox,
        }
    }

    pub fn req_id(&self) -> RequestId {
        match self {
            Self::PostImg { req_id, .. }
            | Self::PostConfig { req_id, .. }
            | Self::ExtractBox { req_id, .. } => *req_id,
        }
    }

    pub fn img_id(&self) -> ImageHandle {
        match self {
            Self::PostImg { img_id, .. }
            | Self::PostConfig { img_id, .. }
            | Self::ExtractBox { img_id, .. } => *img_id,
        }
    }
}

/// Messages from worker to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Response {
    /// Whether the image was fetched and decoded.
    #[serde(rename_all = "camelCase")]
    PostImg { req_id: RequestId, value: bool },

    /// Acknowledgement; `value` is always `null`.
    #[serde(rename_all = "camelCase")]
    PostConfig { req_id: RequestId, value: () },

    /// Encoded box, or `null` when the handle has no image/config or the
    /// region is empty.
    #[serde(rename_all = "camelCase")]
    ExtractBox {
        req_id: RequestId,
        value: Option<Blob>,
    },

    /// Worker unrecoverable error. The worker stops right after sending this;
    /// the client must fail every in-flight request.
    #[serde(rename_all = "camelCase")]
    Fatal {
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<RequestId>,
        reason: String,
    },
}

impl Response {
    /// Action this response answers, `None` for [`Response::Fatal`].
    pub fn action(&self) -> Option<Action> {
        match self {
            Self::PostImg { .. } => Some(Action::PostImg),
            Self::PostConfig { .. } => Some(Action::PostConfig),
            Self::ExtractBox { .. } => Some(Action::ExtractBox),
            Self::Fatal { .. } => None,
        }
    }

    pub fn req_id(&self) -> Option<RequestId> {
        match self {
            Self::PostImg { req_id, .. }
            | Self::PostConfig { req_id, .. }
            | Self::ExtractBox { req_id, .. } => Some(*req_id),
            Self::Fatal { req_id, .. } => *req_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Paddings, Rectangle, Template, Vec2};

    #[test]
    fn post_img_bytes_serializes() {
        let req = Request::PostImg {
            img_id: ImageHandle::new(1),
            req_id: RequestId::new(7),
            img: ImageSource::bytes(b"png!".to_vec()),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "action": "post-img",
          "imgId": 1,
          "reqId": 7,
          "img": {
            "bytes": "cG5nIQ=="
          }
        }
        "#);
    }

    #[test]
    fn post_img_locator_serializes() {
        let req = Request::PostImg {
            img_id: ImageHandle::new(2),
            req_id: RequestId::new(8),
            img: ImageSource::locator("https://example.com/sheet.jpg"),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "action": "post-img",
          "imgId": 2,
          "reqId": 8,
          "img": {
            "locator": "https://example.com/sheet.jpg"
          }
        }
        "#);
    }

    #[test]
    fn post_config_serializes() {
        let req = Request::PostConfig {
            img_id: ImageHandle::new(1),
            req_id: RequestId::new(9),
            config: ExtractConfig::new(
                Template::uniform(2, 1),
                Rectangle::new(Vec2(0.25, 0.0), Vec2(0.5, 1.0)),
            )
            .with_pads(Paddings::NONE),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "action": "post-config",
          "imgId": 1,
          "reqId": 9,
          "config": {
            "model": {
              "kind": "grid",
              "rows": [
                0.0,
                0.5,
                1.0
              ],
              "cols": [
                0.0,
                1.0
              ]
            },
            "coords": {
              "topLeft": [
                0.25,
                0.0
              ],
              "size": [
                0.5,
                1.0
              ]
            },
            "pads": {
              "l": 0.0,
              "r": 0.0,
              "t": 0.0,
              "b": 0.0
            }
          }
        }
        "#);
    }

    #[test]
    fn extract_box_serializes() {
        let req = Request::ExtractBox {
            img_id: ImageHandle::new(3),
            req_id: RequestId::new(12),
            idx: 41,
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "action": "extract-box",
          "imgId": 3,
          "reqId": 12,
          "idx": 41
        }
        "#);
    }

    #[test]
    fn post_config_response_value_is_null() {
        let resp = Response::PostConfig {
            req_id: RequestId::new(4),
            value: (),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "action": "post-config",
          "reqId": 4,
          "value": null
        }
        "#);
    }

    #[test]
    fn extract_box_response_serializes() {
        let hit = Response::ExtractBox {
            req_id: RequestId::new(5),
            value: Some(Blob::new(vec![0, 1, 2])),
        };
        insta::assert_json_snapshot!(hit, @r#"
        {
          "action": "extract-box",
          "reqId": 5,
          "value": "AAEC"
        }
        "#);

        let miss = Response::ExtractBox {
            req_id: RequestId::new(6),
            value: None,
        };
        insta::assert_json_snapshot!(miss, @r#"
        {
          "action": "extract-box",
          "reqId": 6,
          "value": null
        }
        "#);
    }

    #[test]
    fn fatal_serializes() {
        let resp = Response::Fatal {
            req_id: Some(RequestId::new(3)),
            reason: "box index 9 out of range (4 boxes)".to_string(),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "action": "fatal",
          "reqId": 3,
          "reason": "box index 9 out of range (4 boxes)"
        }
        "#);
    }

    #[test]
    fn responses_parse_from_wire() {
        let resp: Response =
            serde_json::from_str(r#"{"action":"post-img","reqId":11,"value":false}"#).unwrap();
        assert_eq!(
            resp,
            Response::PostImg {
                req_id: RequestId::new(11),
                value: false
            }
        );
        assert_eq!(resp.action(), Some(Action::PostImg));

        let resp: Response =
            serde_json::from_str(r#"{"action":"post-config","reqId":12,"value":null}"#).unwrap();
        assert_eq!(resp.req_id(), Some(RequestId::new(12)));

        let resp: Response = serde_json::from_str(r#"{"action":"fatal","reason":"x"}"#).unwrap();
        assert_eq!(resp.action(), None);
        assert_eq!(resp.req_id(), None);
    }

    #[test]
    fn bad_base64_is_rejected() {
        let err = serde_json::from_str::<Response>(
            r#"{"action":"extract-box","reqId":1,"value":"***"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn request_accessors() {
        let req = Request::ExtractBox {
            img_id: ImageHandle::new(4),
            req_id: RequestId::new(2),
            idx: 0,
        };
        assert_eq!(req.action(), Action::ExtractBox);
        assert_eq!(req.req_id(), RequestId::new(2));
        assert_eq!(req.img_id(), ImageHandle::new(4));
        assert_eq!(Action::PostConfig.to_string(), "post-config");
    }
}
