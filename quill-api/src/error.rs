use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::{CommentId, PostId};

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Name already used {0}")]
    NameAlreadyUsed(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid character in name {0:?}")]
    InvalidName(String),

    #[error("Post not found {0:?}")]
    PostNotFound(PostId),

    #[error("Comment not found {0:?}")]
    CommentNotFound(CommentId),

    #[error("Parent comment not found {0:?}")]
    ParentNotFound(CommentId),

    #[error("Operation timed out, it can be retried")]
    Timeout,
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::UuidAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NameAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::InvalidName(_) => StatusCode::BAD_REQUEST,
            Error::PostNotFound(_) => StatusCode::NOT_FOUND,
            Error::CommentNotFound(_) => StatusCode::NOT_FOUND,
            Error::ParentNotFound(_) => StatusCode::NOT_FOUND,
            Error::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "message": "uuid conflict",
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::NameAlreadyUsed(n) => json!({
                "message": "name already used",
                "type": "conflict-name",
                "name": n,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidName(n) => json!({
                "message": "there was an invalid character in a user name",
                "type": "invalid-name",
                "name": n,
            }),
            Error::PostNotFound(p) => json!({
                "message": "post not found",
                "type": "post-not-found",
                "uuid": p.0,
            }),
            Error::CommentNotFound(c) => json!({
                "message": "comment not found",
                "type": "comment-not-found",
                "uuid": c.0,
            }),
            Error::ParentNotFound(c) => json!({
                "message": "parent comment not found",
                "type": "parent-not-found",
                "uuid": c.0,
            }),
            Error::Timeout => json!({
                "message": "operation timed out, please retry",
                "type": "timeout",
            }),
        })
        .expect("serializing error")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let uuid = || {
            data.get("uuid")
                .and_then(|uuid| uuid.as_str())
                .and_then(|uuid| Uuid::from_str(uuid).ok())
                .ok_or_else(|| anyhow!("error is missing a proper uuid"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "permission-denied" => Error::PermissionDenied,
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid()?),
                "conflict-name" => Error::NameAlreadyUsed(String::from(
                    data.get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| anyhow!("error is a name conflict without a name"))?,
                )),
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                "invalid-name" => Error::InvalidName(String::from(
                    data.get("name").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is about an invalid name but no name was provided")
                    })?,
                )),
                "post-not-found" => Error::PostNotFound(PostId(uuid()?)),
                "comment-not-found" => Error::CommentNotFound(CommentId(uuid()?)),
                "parent-not-found" => Error::ParentNotFound(CommentId(uuid()?)),
                "timeout" => Error::Timeout,
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_errors_keep_their_uuid() {
        let id = Uuid::new_v4();
        for err in [
            Error::PostNotFound(PostId(id)),
            Error::CommentNotFound(CommentId(id)),
            Error::ParentNotFound(CommentId(id)),
        ] {
            assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);
            assert_eq!(Error::parse(&err.contents()).unwrap(), err);
        }
    }

    #[test]
    fn timeout_is_retryable() {
        assert_eq!(
            Error::Timeout.status_code(),
            http::StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(Error::parse(&Error::Timeout.contents()).unwrap(), Error::Timeout);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Error::parse(br#"{"type": "nope"}"#).is_err());
        assert!(Error::parse(b"not json").is_err());
    }
}
