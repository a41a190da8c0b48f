use async_trait::async_trait;

use crate::{Comment, CommentId, CommentStatus, Depth, GroupId, PostId, Rank, ThreadGroup};

/// Storage seen by the placement engine and the comment lifecycle.
///
/// All calls made through one `Db` value are expected to belong to the same
/// transaction: implementations either commit everything the lifecycle did,
/// or nothing.
#[async_trait]
pub trait Db: Send {
    /// Serializes the allocation of new groups on `post` until the end of the
    /// transaction, without blocking replies into existing groups
    async fn lock_post(&mut self, _post: PostId) -> anyhow::Result<()> {
        Ok(())
    }

    /// Serializes every placement inside `group` until the end of the
    /// transaction, without blocking placements in other groups
    async fn lock_group(&mut self, _group: ThreadGroup) -> anyhow::Result<()> {
        Ok(())
    }

    /// `None` if the post does not exist, otherwise whether it is active
    async fn post_exists(&mut self, post: PostId) -> anyhow::Result<Option<bool>>;
    async fn post_comment_count_changed(&mut self, post: PostId, delta: i64)
        -> anyhow::Result<()>;

    async fn max_group_id(&mut self, post: PostId) -> anyhow::Result<Option<GroupId>>;
    async fn max_depth(&mut self, group: ThreadGroup) -> anyhow::Result<Option<Depth>>;
    async fn max_rank(&mut self, group: ThreadGroup) -> anyhow::Result<Option<Rank>>;
    async fn sum_child_count(&mut self, group: ThreadGroup) -> anyhow::Result<i64>;

    /// Smallest rank strictly after `rank` whose depth is at most `depth`, ie.
    /// the first comment that is not a descendant of the comment at `rank`
    async fn first_rank_after_subtree(
        &mut self,
        group: ThreadGroup,
        rank: Rank,
        depth: Depth,
    ) -> anyhow::Result<Option<Rank>>;

    /// Adds `delta` to the rank of every comment of `group` ranked strictly
    /// above `threshold`
    async fn shift_ranks_above(
        &mut self,
        group: ThreadGroup,
        threshold: Rank,
        delta: i64,
    ) -> anyhow::Result<()>;

    async fn insert_comment(&mut self, comment: &Comment) -> anyhow::Result<()>;
    async fn increment_child_count(&mut self, comment: CommentId) -> anyhow::Result<()>;
    async fn get_comment(&mut self, comment: CommentId) -> anyhow::Result<Option<Comment>>;

    /// Also marks the comment as edited
    async fn update_content(&mut self, comment: CommentId, content: &str) -> anyhow::Result<()>;
    async fn set_status(&mut self, comment: CommentId, status: CommentStatus)
        -> anyhow::Result<()>;

    /// Every stored comment of the group, deleted ones included
    async fn list_by_group_ordered_by_rank(
        &mut self,
        group: ThreadGroup,
    ) -> anyhow::Result<Vec<Comment>>;
}
