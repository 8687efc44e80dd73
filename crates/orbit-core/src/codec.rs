//! Conversions from pipeline outputs to wire representations.
//!
//! Sync routes turn their `respond` output into an HTTP [`Reply`] through
//! [`IntoReply`]; stream routes turn their `produce` output into a broker
//! payload through [`Encode`].

use bytes::Bytes;
use orbit_transport::{Reply, StatusCode};
use serde::Serialize;

/// Boxed error returned by pipeline stages.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Serialize the wrapped value as JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

/// Conversion into an HTTP reply. Plain values default to `200 OK`.
pub trait IntoReply {
    /// Build the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    fn into_reply(self) -> Result<Reply, BoxError>;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Result<Reply, BoxError> {
        Ok(self)
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Result<Reply, BoxError> {
        Ok(Reply::text(self))
    }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> Result<Reply, BoxError> {
        Ok(Reply::text(self))
    }
}

impl IntoReply for serde_json::Value {
    fn into_reply(self) -> Result<Reply, BoxError> {
        Ok(Reply::json(&self))
    }
}

impl<T: Serialize> IntoReply for Json<T> {
    fn into_reply(self) -> Result<Reply, BoxError> {
        let value = serde_json::to_value(&self.0)?;
        Ok(Reply::json(&value))
    }
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Reply, BoxError> {
        Ok(Reply {
            status: StatusCode::NO_CONTENT,
            content_type: None,
            body: Bytes::new(),
        })
    }
}

impl<T: IntoReply> IntoReply for (StatusCode, T) {
    fn into_reply(self) -> Result<Reply, BoxError> {
        Ok(self.1.into_reply()?.with_status(self.0))
    }
}

/// Conversion into a broker payload.
pub trait Encode {
    /// Serialize the value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    fn encode(self) -> Result<Bytes, BoxError>;
}

impl Encode for Bytes {
    fn encode(self) -> Result<Bytes, BoxError> {
        Ok(self)
    }
}

impl Encode for Vec<u8> {
    fn encode(self) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(self))
    }
}

impl Encode for String {
    fn encode(self) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(self))
    }
}

impl Encode for &'static str {
    fn encode(self) -> Result<Bytes, BoxError> {
        Ok(Bytes::from_static(self.as_bytes()))
    }
}

impl Encode for serde_json::Value {
    fn encode(self) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(&self)?))
    }
}

impl<T: Serialize> Encode for Json<T> {
    fn encode(self) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_reply_is_sent_verbatim() {
        let reply = String::from(r#"["india","usa","uk"]"#).into_reply().unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(&reply.body[..], br#"["india","usa","uk"]"#);
    }

    #[test]
    fn test_json_reply() {
        let reply = Json(vec!["a", "b"]).into_reply().unwrap();
        assert_eq!(reply.content_type, Some("application/json"));
        assert_eq!(&reply.body[..], br#"["a","b"]"#);
    }

    #[test]
    fn test_status_override() {
        let reply = (StatusCode::CREATED, json!({"id": 7})).into_reply().unwrap();
        assert_eq!(reply.status, StatusCode::CREATED);

        let empty = ().into_reply().unwrap();
        assert_eq!(empty.status, StatusCode::NO_CONTENT);
        assert!(empty.body.is_empty());
    }

    #[test]
    fn test_encode() {
        assert_eq!(&String::from("hi").encode().unwrap()[..], b"hi");
        assert_eq!(&Json(json!({"n": 1})).encode().unwrap()[..], br#"{"n":1}"#);
        assert_eq!(&"x".encode().unwrap()[..], b"x");
    }
}
