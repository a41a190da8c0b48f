use std::{fmt, time::Duration};

use anyhow::Context;
use quill_api::{
    self as api, Comment, CommentId, Error as ApiError, NewComment, PlacementStrategy, UserId,
};

use crate::{
    db::{self, PostgresDb},
    extractors::PgPool,
    Error,
};

#[derive(Clone, Copy, Debug)]
pub struct CommentConfig {
    pub strategy: PlacementStrategy,

    /// How many times a transaction that lost a race against a concurrent one
    /// is replayed before giving up
    pub max_conflict_retries: usize,

    /// Deadline for the whole operation, retries included
    pub transaction_timeout: Duration,
}

impl Default for CommentConfig {
    fn default() -> CommentConfig {
        CommentConfig {
            strategy: PlacementStrategy::default(),
            max_conflict_retries: 5,
            transaction_timeout: Duration::from_secs(5),
        }
    }
}

/// A comment mutation, replayable as a whole in a fresh transaction
#[derive(Clone, Debug)]
pub enum CommentOp {
    Create { author: UserId, new: NewComment },
    Edit {
        user: UserId,
        id: CommentId,
        content: String,
    },
    Delete { user: UserId, id: CommentId },
}

// Only identifiers, comment bodies must stay out of the logs
impl fmt::Display for CommentOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommentOp::Create { author, new } => write!(
                f,
                "creation of comment {:?} by {:?} on post {:?} under {:?}",
                new.id, author, new.post_id, new.parent_id
            ),
            CommentOp::Edit { user, id, .. } => write!(f, "edition of comment {id:?} by {user:?}"),
            CommentOp::Delete { user, id } => write!(f, "deletion of comment {id:?} by {user:?}"),
        }
    }
}

async fn attempt_once(
    pool: &PgPool,
    strategy: PlacementStrategy,
    op: CommentOp,
) -> anyhow::Result<Result<Comment, ApiError>> {
    let mut tx = pool.begin().await?;
    let res = {
        let mut db = PostgresDb { conn: &mut *tx };
        match op {
            CommentOp::Create { author, new } => {
                api::create_comment(&mut db, strategy, author, new).await?
            }
            CommentOp::Edit { user, id, content } => {
                api::edit_comment(&mut db, user, id, content).await?
            }
            CommentOp::Delete { user, id } => api::soft_delete_comment(&mut db, user, id).await?,
        }
    };
    match res {
        Ok(comment) => {
            // deferred rank uniqueness is only checked here
            tx.commit().await.context("committing comment transaction")?;
            Ok(Ok(comment))
        }
        Err(e) => {
            tx.rollback()
                .await
                .context("rolling back comment transaction")?;
            Ok(Err(e))
        }
    }
}

async fn run_with_retries(
    pool: &PgPool,
    config: &CommentConfig,
    op: &CommentOp,
) -> Result<Comment, Error> {
    let mut attempt = 0;
    loop {
        match attempt_once(pool, config.strategy, op.clone()).await {
            Ok(res) => return Ok(res?),
            Err(e) if db::is_conflict(&e) && attempt < config.max_conflict_retries => {
                attempt += 1;
                tracing::debug!(%op, attempt, err = %e, "conflicting transaction, retrying");
            }
            Err(e) => {
                if db::is_conflict(&e) {
                    tracing::warn!(%op, attempt, "giving up after too many conflicts");
                }
                return Err(Error::Anyhow(e.context(format!("running {op}"))));
            }
        }
    }
}

/// Runs `op` in its own transaction, retrying it on conflicts with
/// concurrent transactions, and aborting it if it takes too long
pub async fn run_comment_op(
    pool: &PgPool,
    config: &CommentConfig,
    op: CommentOp,
) -> Result<Comment, Error> {
    match tokio::time::timeout(config.transaction_timeout, run_with_retries(pool, config, &op))
        .await
    {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(%op, timeout = ?config.transaction_timeout, "comment transaction timed out");
            Err(Error::timeout())
        }
    }
}
