use std::collections::HashMap;

use async_trait::async_trait;
use quill_api::{
    Comment, CommentId, CommentStatus, Db, Depth, GroupId, Post, PostId, Rank, ThreadGroup,
};

/// In-memory order index. Cloning it is how the mock server stages a
/// transaction: work on a copy, and only keep it if everything went well.
#[derive(Clone, Debug, Default)]
pub struct MemDb {
    pub posts: HashMap<PostId, Post>,
    pub comments: HashMap<CommentId, Comment>,
}

impl MemDb {
    fn group(&self, group: ThreadGroup) -> impl Iterator<Item = &Comment> {
        self.comments
            .values()
            .filter(move |c| c.post_id == group.post && c.group_id == group.id)
    }
}

#[async_trait]
impl Db for MemDb {
    async fn post_exists(&mut self, post: PostId) -> anyhow::Result<Option<bool>> {
        Ok(self.posts.get(&post).map(|p| p.active))
    }

    async fn post_comment_count_changed(&mut self, post: PostId, delta: i64) -> anyhow::Result<()> {
        let p = self
            .posts
            .get_mut(&post)
            .ok_or_else(|| anyhow::anyhow!("post {post:?} disappeared"))?;
        p.comment_count += delta;
        Ok(())
    }

    async fn max_group_id(&mut self, post: PostId) -> anyhow::Result<Option<GroupId>> {
        Ok(self
            .comments
            .values()
            .filter(|c| c.post_id == post)
            .map(|c| c.group_id)
            .max())
    }

    async fn max_depth(&mut self, group: ThreadGroup) -> anyhow::Result<Option<Depth>> {
        Ok(self.group(group).map(|c| c.depth).max())
    }

    async fn max_rank(&mut self, group: ThreadGroup) -> anyhow::Result<Option<Rank>> {
        Ok(self.group(group).map(|c| c.rank).max())
    }

    async fn sum_child_count(&mut self, group: ThreadGroup) -> anyhow::Result<i64> {
        Ok(self.group(group).map(|c| c.child_count).sum())
    }

    async fn first_rank_after_subtree(
        &mut self,
        group: ThreadGroup,
        rank: Rank,
        depth: Depth,
    ) -> anyhow::Result<Option<Rank>> {
        Ok(self
            .group(group)
            .filter(|c| c.rank > rank && c.depth <= depth)
            .map(|c| c.rank)
            .min())
    }

    async fn shift_ranks_above(
        &mut self,
        group: ThreadGroup,
        threshold: Rank,
        delta: i64,
    ) -> anyhow::Result<()> {
        for c in self.comments.values_mut() {
            if c.post_id == group.post && c.group_id == group.id && c.rank > threshold {
                c.rank += delta;
            }
        }
        Ok(())
    }

    async fn insert_comment(&mut self, comment: &Comment) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.comments.contains_key(&comment.id),
            "comment {:?} already exists",
            comment.id
        );
        self.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn increment_child_count(&mut self, comment: CommentId) -> anyhow::Result<()> {
        self.comments
            .get_mut(&comment)
            .ok_or_else(|| anyhow::anyhow!("comment {comment:?} disappeared"))?
            .child_count += 1;
        Ok(())
    }

    async fn get_comment(&mut self, comment: CommentId) -> anyhow::Result<Option<Comment>> {
        Ok(self.comments.get(&comment).cloned())
    }

    async fn update_content(&mut self, comment: CommentId, content: &str) -> anyhow::Result<()> {
        let c = self
            .comments
            .get_mut(&comment)
            .ok_or_else(|| anyhow::anyhow!("comment {comment:?} disappeared"))?;
        c.content = String::from(content);
        c.edited = true;
        Ok(())
    }

    async fn set_status(&mut self, comment: CommentId, status: CommentStatus) -> anyhow::Result<()> {
        self.comments
            .get_mut(&comment)
            .ok_or_else(|| anyhow::anyhow!("comment {comment:?} disappeared"))?
            .status = status;
        Ok(())
    }

    async fn list_by_group_ordered_by_rank(
        &mut self,
        group: ThreadGroup,
    ) -> anyhow::Result<Vec<Comment>> {
        let mut res = self.group(group).cloned().collect::<Vec<_>>();
        res.sort_by_key(|c| c.rank);
        Ok(res)
    }
}
