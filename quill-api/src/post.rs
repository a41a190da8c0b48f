use uuid::Uuid;

use crate::{Error, Time, UserId, STUB_UUID};

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
pub struct PostId(#[generator(bolero::generator::gen_arbitrary())] pub Uuid);

impl PostId {
    pub fn stub() -> PostId {
        PostId(STUB_UUID)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Post {
    pub id: PostId,
    pub owner_id: UserId,
    pub title: String,
    pub active: bool,

    /// Number of active comments on this post
    pub comment_count: i64,

    pub created_at: Time,
}

#[derive(
    Clone, Debug, Eq, PartialEq, bolero::generator::TypeGenerator, serde::Deserialize, serde::Serialize,
)]
pub struct NewPost {
    pub id: PostId,
    #[generator(bolero::generator::gen_with::<String>().len(0..50usize))]
    pub title: String,
}

impl NewPost {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.title)
    }
}
