use uuid::Uuid;

use crate::{Error, PostId, Time, UserId, STUB_UUID};

/// Position of a comment in the pre-order traversal of its group, starting at 1
pub type Rank = i64;

/// Distance from the root of the group, the root being at depth 1
pub type Depth = i32;

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct CommentId(#[generator(bolero::generator::gen_arbitrary())] pub Uuid);

impl CommentId {
    pub fn stub() -> CommentId {
        CommentId(STUB_UUID)
    }
}

/// Identifies one reply tree among the ones of a post. Only unique within a post.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct GroupId(pub i64);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentStatus {
    Active,
    Deleted,
}

impl CommentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentStatus::Active => "active",
            CommentStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<CommentStatus> {
        match s {
            "active" => Some(CommentStatus::Active),
            "deleted" => Some(CommentStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub author_id: UserId,
    pub parent_id: Option<CommentId>,

    pub group_id: GroupId,
    pub rank: Rank,
    pub depth: Depth,

    /// Number of direct replies ever recorded against this comment,
    /// including the ones that were since deleted
    pub child_count: i64,

    pub content: String,
    pub edited: bool,
    pub status: CommentStatus,
    pub created_at: Time,
}

impl Comment {
    pub fn is_active(&self) -> bool {
        self.status == CommentStatus::Active
    }

    /// The comment as it can be shown to readers: deleted comments keep their
    /// place in the thread but lose their contents
    pub fn redacted(mut self) -> Comment {
        if !self.is_active() {
            self.content = String::new();
        }
        self
    }
}

#[derive(
    Clone, Debug, Eq, PartialEq, bolero::generator::TypeGenerator, serde::Deserialize, serde::Serialize,
)]
pub struct NewComment {
    pub id: CommentId,
    pub post_id: PostId,
    pub parent_id: Option<CommentId>,
    #[generator(bolero::generator::gen_with::<String>().len(0..100usize))]
    pub content: String,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.content)
    }
}
