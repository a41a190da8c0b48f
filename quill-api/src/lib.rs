mod auth;
mod comment;
mod db;
mod error;
mod lifecycle;
pub mod placement;
mod post;
mod thread;
mod user;

pub use auth::{AuthToken, NewSession};
pub use comment::{Comment, CommentId, CommentStatus, Depth, GroupId, NewComment, Rank};
pub use db::Db;
pub use error::Error;
pub use lifecycle::{create_comment, edit_comment, soft_delete_comment};
pub use placement::{Placement, PlacementStrategy, RankShift, ThreadGroup};
pub use post::{NewPost, Post, PostId};
pub use thread::{fetch_thread, ThreadEntry};
pub use user::{NewUser, User, UserId};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<chrono::Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FeedMessage {
    Pong,
    NewComment(Comment),
    EditedComment(Comment),
    DeletedComment(Comment),
}

impl FeedMessage {
    pub fn post_id(&self) -> Option<PostId> {
        match self {
            FeedMessage::Pong => None,
            FeedMessage::NewComment(c)
            | FeedMessage::EditedComment(c)
            | FeedMessage::DeletedComment(c) => Some(c.post_id),
        }
    }
}

// Postgres rejects null bytes in TEXT columns, so refuse them early and
// consistently across the server and the mock server
pub(crate) fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_bytes_are_rejected() {
        assert_eq!(validate_string("hello"), Ok(()));
        assert_eq!(
            validate_string("hel\0lo"),
            Err(Error::NullByteInString(String::from("hel\0lo")))
        );
    }
}
