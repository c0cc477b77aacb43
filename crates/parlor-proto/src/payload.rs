//! Opaque payload parts.
//!
//! Messages travel as a list of byte frames next to the property header. For
//! every message type this client understands, each frame is a JSON document.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, Result};

/// Ordered list of payload frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Vec<Bytes>);

impl Payload {
    /// No frames.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Payload made of the given frames.
    pub fn from_parts(parts: Vec<Bytes>) -> Self {
        Self(parts)
    }

    /// Single JSON frame holding `body`.
    pub fn json<T: Serialize + ?Sized>(body: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(body).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self(vec![Bytes::from(encoded)]))
    }

    /// Decode every frame as a JSON document of type `T`.
    pub fn decode_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.0
            .iter()
            .enumerate()
            .map(|(index, part)| {
                serde_json::from_slice(part)
                    .map_err(|e| ProtocolError::InvalidPayload { index, reason: e.to_string() })
            })
            .collect()
    }

    /// Decode the first frame, failing if the payload is empty.
    pub fn decode_first<T: DeserializeOwned>(&self) -> Result<T> {
        let part = self.0.first().ok_or_else(|| ProtocolError::InvalidPayload {
            index: 0,
            reason: "payload is empty".to_owned(),
        })?;
        serde_json::from_slice(part)
            .map_err(|e| ProtocolError::InvalidPayload { index: 0, reason: e.to_string() })
    }

    /// Raw frames.
    pub fn parts(&self) -> &[Bytes] {
        &self.0
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no frames.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Body {
        text: String,
    }

    #[test]
    fn json_frame_decodes() {
        let payload = Payload::json(&Body { text: "hi".into() }).unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload.decode_first::<Body>().unwrap(), Body { text: "hi".into() });
    }

    #[test]
    fn bad_frame_reports_index() {
        let payload = Payload::from_parts(vec![
            Bytes::from_static(br#"{"text":"ok"}"#),
            Bytes::from_static(b"not json"),
        ]);
        match payload.decode_all::<Body>() {
            Err(ProtocolError::InvalidPayload { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected invalid payload, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_has_no_first_frame() {
        assert!(Payload::empty().decode_first::<Body>().is_err());
    }
}
