use quill_api::{CommentId, Error as ApiError, PostId, Uuid};

/// Failure of a handler. Business errors reach the client as is, anything
/// else becomes an opaque `Unknown`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub fn permission_denied() -> Error {
        ApiError::PermissionDenied.into()
    }

    pub fn uuid_already_used(uuid: Uuid) -> Error {
        ApiError::UuidAlreadyUsed(uuid).into()
    }

    pub fn name_already_used(name: String) -> Error {
        ApiError::NameAlreadyUsed(name).into()
    }

    pub fn post_not_found(post: PostId) -> Error {
        ApiError::PostNotFound(post).into()
    }

    pub fn comment_not_found(comment: CommentId) -> Error {
        ApiError::CommentNotFound(comment).into()
    }

    pub fn timeout() -> Error {
        ApiError::Timeout.into()
    }

    fn into_api(self) -> ApiError {
        match self {
            Error::Api(err) => err,
            Error::Anyhow(err) => {
                tracing::error!(?err, "internal server error");
                if cfg!(test) {
                    ApiError::Unknown(format!("Internal server error: {err:?}"))
                } else {
                    ApiError::Unknown(String::from("Internal server error, see logs for details"))
                }
            }
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let internal = matches!(self, Error::Anyhow(_));
        let err = self.into_api();
        let status = err.status_code();
        match err {
            ApiError::Timeout => tracing::warn!(%status, "comment transaction gave up: {err}"),
            _ if !internal => tracing::info!(%status, "returning error to client: {err}"),
            _ => (),
        }
        (status, err.contents()).into_response()
    }
}
