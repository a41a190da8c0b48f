use anyhow::Context;
use chrono::SubsecRound;

use crate::{
    placement, Comment, CommentId, CommentStatus, Db, Error, NewComment, PlacementStrategy,
    ThreadGroup, UserId,
};

/// Creates a comment, placing it in its thread group.
///
/// The outer error is a storage failure, in which case the caller must roll
/// back whatever `db` already did: the rank shift is not idempotent.
pub async fn create_comment<D: Db>(
    db: &mut D,
    strategy: PlacementStrategy,
    author: UserId,
    new: NewComment,
) -> anyhow::Result<Result<Comment, Error>> {
    if let Err(e) = new.validate() {
        return Ok(Err(e));
    }
    let post = new.post_id;
    if db
        .post_exists(post)
        .await
        .with_context(|| format!("checking that post {post:?} exists"))?
        != Some(true)
    {
        return Ok(Err(Error::PostNotFound(post)));
    }
    if db
        .get_comment(new.id)
        .await
        .with_context(|| format!("checking that comment id {:?} is free", new.id))?
        .is_some()
    {
        return Ok(Err(Error::UuidAlreadyUsed(new.id.0)));
    }

    let parent = match new.parent_id {
        None => {
            db.lock_post(post)
                .await
                .with_context(|| format!("locking post {post:?}"))?;
            None
        }
        Some(parent_id) => {
            let group = match db
                .get_comment(parent_id)
                .await
                .with_context(|| format!("fetching parent comment {parent_id:?}"))?
            {
                Some(p) if p.is_active() && p.post_id == post => ThreadGroup {
                    post,
                    id: p.group_id,
                },
                _ => return Ok(Err(Error::ParentNotFound(parent_id))),
            };
            db.lock_group(group)
                .await
                .with_context(|| format!("locking {group:?}"))?;
            // rank and child count may have moved while waiting for the lock
            match db
                .get_comment(parent_id)
                .await
                .with_context(|| format!("re-fetching parent comment {parent_id:?}"))?
            {
                Some(p) if p.is_active() => Some(p),
                _ => return Ok(Err(Error::ParentNotFound(parent_id))),
            }
        }
    };

    let placement = placement::place(&mut *db, strategy, post, parent.as_ref())
        .await
        .with_context(|| format!("placing comment {:?}", new.id))?;
    let group = ThreadGroup {
        post,
        id: placement.group,
    };
    if let Some(shift) = placement.shift {
        db.shift_ranks_above(group, shift.above, shift.by)
            .await
            .with_context(|| format!("shifting ranks of {group:?} above {}", shift.above))?;
    }

    let comment = Comment {
        id: new.id,
        post_id: post,
        author_id: author,
        parent_id: new.parent_id,
        group_id: placement.group,
        rank: placement.rank,
        depth: placement.depth,
        child_count: 0,
        content: new.content,
        edited: false,
        status: CommentStatus::Active,
        // stored with microsecond precision
        created_at: chrono::Utc::now().trunc_subsecs(6),
    };
    db.insert_comment(&comment)
        .await
        .with_context(|| format!("inserting comment {:?}", comment.id))?;
    if let Some(parent) = &parent {
        db.increment_child_count(parent.id)
            .await
            .with_context(|| format!("incrementing child count of {:?}", parent.id))?;
    }
    db.post_comment_count_changed(post, 1)
        .await
        .with_context(|| format!("incrementing comment count of post {post:?}"))?;

    tracing::debug!(
        comment = ?comment.id,
        ?post,
        group = comment.group_id.0,
        rank = comment.rank,
        depth = comment.depth,
        "created comment"
    );
    Ok(Ok(comment))
}

async fn fetch_own_active_comment<D: Db>(
    db: &mut D,
    user: UserId,
    id: CommentId,
) -> anyhow::Result<Result<Comment, Error>> {
    let comment = match db
        .get_comment(id)
        .await
        .with_context(|| format!("fetching comment {id:?}"))?
    {
        Some(c) if c.is_active() => c,
        _ => return Ok(Err(Error::CommentNotFound(id))),
    };
    if comment.author_id != user {
        return Ok(Err(Error::PermissionDenied));
    }
    Ok(Ok(comment))
}

/// Replaces the contents of a comment. Ordering fields are never touched.
pub async fn edit_comment<D: Db>(
    db: &mut D,
    user: UserId,
    id: CommentId,
    content: String,
) -> anyhow::Result<Result<Comment, Error>> {
    if let Err(e) = crate::validate_string(&content) {
        return Ok(Err(e));
    }
    let mut comment = match fetch_own_active_comment(&mut *db, user, id).await? {
        Ok(c) => c,
        Err(e) => return Ok(Err(e)),
    };
    db.update_content(id, &content)
        .await
        .with_context(|| format!("updating contents of comment {id:?}"))?;
    comment.content = content;
    comment.edited = true;
    tracing::debug!(comment = ?id, "edited comment");
    Ok(Ok(comment))
}

/// Marks a comment as deleted. Its rank stays in place and it keeps being
/// counted in its parent's child count.
pub async fn soft_delete_comment<D: Db>(
    db: &mut D,
    user: UserId,
    id: CommentId,
) -> anyhow::Result<Result<Comment, Error>> {
    let mut comment = match fetch_own_active_comment(&mut *db, user, id).await? {
        Ok(c) => c,
        Err(e) => return Ok(Err(e)),
    };
    db.set_status(id, CommentStatus::Deleted)
        .await
        .with_context(|| format!("marking comment {id:?} as deleted"))?;
    db.post_comment_count_changed(comment.post_id, -1)
        .await
        .with_context(|| format!("decrementing comment count of post {:?}", comment.post_id))?;
    comment.status = CommentStatus::Deleted;
    tracing::debug!(comment = ?id, post = ?comment.post_id, "deleted comment");
    Ok(Ok(comment.redacted()))
}
