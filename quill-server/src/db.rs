use anyhow::Context;
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use quill_api::{
    AuthToken, Comment, CommentId, CommentStatus, Db, Depth, GroupId, NewPost, NewSession, NewUser,
    Post, PostId, Rank, ThreadGroup, UserId, Uuid,
};
use sqlx::{postgres::PgRow, Row};

use crate::Error;

macro_rules! comment_columns {
    () => {
        "id, post_id, author_id, parent_id, group_id, rank, depth, child_count, content, edited, status, created_at"
    };
}

fn comment_from_row(row: &PgRow) -> anyhow::Result<Comment> {
    let status: String = row.try_get("status").context("retrieving the status field")?;
    Ok(Comment {
        id: CommentId(row.try_get("id").context("retrieving the id field")?),
        post_id: PostId(row.try_get("post_id").context("retrieving the post_id field")?),
        author_id: UserId(
            row.try_get("author_id")
                .context("retrieving the author_id field")?,
        ),
        parent_id: row
            .try_get::<Option<Uuid>, _>("parent_id")
            .context("retrieving the parent_id field")?
            .map(CommentId),
        group_id: GroupId(
            row.try_get("group_id")
                .context("retrieving the group_id field")?,
        ),
        rank: row.try_get("rank").context("retrieving the rank field")?,
        depth: row.try_get("depth").context("retrieving the depth field")?,
        child_count: row
            .try_get("child_count")
            .context("retrieving the child_count field")?,
        content: row.try_get("content").context("retrieving the content field")?,
        edited: row.try_get("edited").context("retrieving the edited field")?,
        status: CommentStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown comment status {status:?}"))?,
        created_at: row
            .try_get("created_at")
            .context("retrieving the created_at field")?,
    })
}

fn post_from_row(row: &PgRow) -> anyhow::Result<Post> {
    Ok(Post {
        id: PostId(row.try_get("id").context("retrieving the id field")?),
        owner_id: UserId(
            row.try_get("owner_id")
                .context("retrieving the owner_id field")?,
        ),
        title: row.try_get("title").context("retrieving the title field")?,
        active: row.try_get("active").context("retrieving the active field")?,
        comment_count: row
            .try_get("comment_count")
            .context("retrieving the comment_count field")?,
        created_at: row
            .try_get("created_at")
            .context("retrieving the created_at field")?,
    })
}

/// Whether `err` was caused by a concurrent transaction, in which case the
/// whole transaction can be retried from scratch
pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|e| match e.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(e)) => matches!(
            e.code().as_deref(),
            Some("40001") | Some("40P01") | Some("23505")
        ),
        _ => false,
    })
}

pub async fn create_user(conn: &mut sqlx::PgConnection, u: NewUser) -> Result<(), Error> {
    let name_taken = sqlx::query("SELECT 1 FROM users WHERE name = $1")
        .bind(&u.name)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("checking whether user name {:?} is taken", u.name))?
        .is_some();
    if name_taken {
        return Err(Error::name_already_used(u.name));
    }
    let id_taken = sqlx::query("SELECT 1 FROM users WHERE id = $1")
        .bind(u.id.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("checking whether user id {:?} is taken", u.id))?
        .is_some();
    if id_taken {
        return Err(Error::uuid_already_used(u.id.0));
    }
    sqlx::query("INSERT INTO users (id, name, password_hash) VALUES ($1, $2, $3)")
        .bind(u.id.0)
        .bind(&u.name)
        .bind(&u.initial_password_hash)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("inserting user {:?}", u.id))?;
    tracing::info!(user = ?u.id, "created user");
    Ok(())
}

pub async fn login_user(
    conn: &mut sqlx::PgConnection,
    s: &NewSession,
) -> anyhow::Result<Option<AuthToken>> {
    let user = sqlx::query("SELECT id, password_hash FROM users WHERE name = $1")
        .bind(&s.user)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("fetching password hash of user {:?}", s.user))?;
    let user = match user {
        Some(user) => user,
        None => return Ok(None),
    };
    let user_id: Uuid = user.try_get("id").context("retrieving the id field")?;
    let hash: String = user
        .try_get("password_hash")
        .context("retrieving the password_hash field")?;

    // tests do not go through bcrypt, it would make them much too slow
    #[cfg(test)]
    let password_ok = s.password == hash;
    #[cfg(not(test))]
    let password_ok = bcrypt::verify(&s.password, &hash)
        .with_context(|| format!("verifying password of user {user_id:?}"))?;
    if !password_ok {
        return Ok(None);
    }

    let token = AuthToken(Uuid::new_v4());
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sessions (id, user_id, name, login_time, last_active) VALUES ($1, $2, $3, $4, $4)",
    )
    .bind(token.0)
    .bind(user_id)
    .bind(&s.device)
    .bind(now)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("inserting new session for user {user_id:?}"))?;
    tracing::debug!(user = ?user_id, device = ?s.device, "user logged in");
    Ok(Some(token))
}

/// Returns `true` iff the session existed
pub async fn logout_user(conn: &mut sqlx::PgConnection, token: &AuthToken) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(token.0)
        .execute(&mut *conn)
        .await
        .context("deleting session")?;
    Ok(res.rows_affected() == 1)
}

pub async fn recover_session(
    conn: &mut sqlx::PgConnection,
    token: AuthToken,
) -> Result<UserId, Error> {
    let row = sqlx::query("UPDATE sessions SET last_active = $1 WHERE id = $2 RETURNING user_id")
        .bind(Utc::now())
        .bind(token.0)
        .fetch_optional(&mut *conn)
        .await
        .context("recovering session")?
        .ok_or(Error::permission_denied())?;
    Ok(UserId(
        row.try_get("user_id")
            .context("retrieving the user_id field")?,
    ))
}

pub async fn create_post(
    conn: &mut sqlx::PgConnection,
    owner: UserId,
    p: NewPost,
) -> Result<Post, Error> {
    let taken = sqlx::query("SELECT 1 FROM posts WHERE id = $1")
        .bind(p.id.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("checking whether post id {:?} is taken", p.id))?
        .is_some();
    if taken {
        return Err(Error::uuid_already_used(p.id.0));
    }
    let post = Post {
        id: p.id,
        owner_id: owner,
        title: p.title,
        active: true,
        comment_count: 0,
        created_at: Utc::now().trunc_subsecs(6),
    };
    sqlx::query(
        "
            INSERT INTO posts (id, owner_id, title, active, created_at)
            VALUES ($1, $2, $3, $4, $5)
        ",
    )
    .bind(post.id.0)
    .bind(post.owner_id.0)
    .bind(&post.title)
    .bind(post.active)
    .bind(post.created_at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("inserting post {:?}", post.id))?;
    tracing::info!(post = ?post.id, owner = ?owner, "created post");
    Ok(post)
}

pub async fn fetch_post(conn: &mut sqlx::PgConnection, id: PostId) -> Result<Post, Error> {
    let row = sqlx::query(
        "
            SELECT id, owner_id, title, active, created_at,
                    (
                        SELECT COALESCE(SUM(delta), 0)::BIGINT
                            FROM post_comment_count_changes
                        WHERE post_id = posts.id
                    ) AS comment_count
                FROM posts
            WHERE id = $1
            AND active
        ",
    )
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await
    .with_context(|| format!("fetching post {id:?}"))?
    .ok_or(Error::post_not_found(id))?;
    Ok(post_from_row(&row)?)
}

pub async fn delete_post(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    id: PostId,
) -> Result<(), Error> {
    let row = sqlx::query("SELECT owner_id FROM posts WHERE id = $1 AND active")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("fetching owner of post {id:?}"))?
        .ok_or(Error::post_not_found(id))?;
    let owner: Uuid = row
        .try_get("owner_id")
        .context("retrieving the owner_id field")?;
    if owner != user.0 {
        return Err(Error::permission_denied());
    }
    sqlx::query("UPDATE posts SET active = false WHERE id = $1")
        .bind(id.0)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("deactivating post {id:?}"))?;
    tracing::info!(post = ?id, "deleted post");
    Ok(())
}

pub async fn fetch_comment(conn: &mut sqlx::PgConnection, id: CommentId) -> Result<Comment, Error> {
    let comment = PostgresDb { conn }
        .get_comment(id)
        .await?
        .ok_or(Error::comment_not_found(id))?;
    Ok(comment.redacted())
}

/// Order index store backed by one Postgres connection, usually one on which
/// a transaction was started
pub struct PostgresDb<'a> {
    pub conn: &'a mut sqlx::PgConnection,
}

#[async_trait]
impl<'a> Db for PostgresDb<'a> {
    async fn lock_post(&mut self, post: PostId) -> anyhow::Result<()> {
        // FOR UPDATE would also wait for the foreign key checks of comments
        // being inserted into other groups of the post
        sqlx::query("SELECT id FROM posts WHERE id = $1 FOR NO KEY UPDATE")
            .bind(post.0)
            .fetch_optional(&mut *self.conn)
            .await
            .with_context(|| format!("locking post {post:?}"))?;
        Ok(())
    }

    async fn lock_group(&mut self, group: ThreadGroup) -> anyhow::Result<()> {
        sqlx::query(
            "
                SELECT id
                    FROM comments
                WHERE post_id = $1
                AND group_id = $2
                AND parent_id IS NULL
                FOR NO KEY UPDATE
            ",
        )
        .bind(group.post.0)
        .bind(group.id.0)
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("locking root of {group:?}"))?;
        Ok(())
    }

    async fn post_exists(&mut self, post: PostId) -> anyhow::Result<Option<bool>> {
        let row = sqlx::query("SELECT active FROM posts WHERE id = $1")
            .bind(post.0)
            .fetch_optional(&mut *self.conn)
            .await
            .with_context(|| format!("fetching post {post:?}"))?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(
                row.try_get("active")
                    .context("retrieving the active field")?,
            )),
        }
    }

    async fn post_comment_count_changed(&mut self, post: PostId, delta: i64) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO post_comment_count_changes (post_id, delta) VALUES ($1, $2)")
            .bind(post.0)
            .bind(delta)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("recording comment count change of post {post:?}"))?;
        Ok(())
    }

    async fn max_group_id(&mut self, post: PostId) -> anyhow::Result<Option<GroupId>> {
        let row = sqlx::query("SELECT MAX(group_id) AS max FROM comments WHERE post_id = $1")
            .bind(post.0)
            .fetch_one(&mut *self.conn)
            .await
            .with_context(|| format!("fetching max group id of post {post:?}"))?;
        Ok(row
            .try_get::<Option<i64>, _>("max")
            .context("retrieving the max field")?
            .map(GroupId))
    }

    async fn max_depth(&mut self, group: ThreadGroup) -> anyhow::Result<Option<Depth>> {
        let row = sqlx::query(
            "SELECT MAX(depth) AS max FROM comments WHERE post_id = $1 AND group_id = $2",
        )
        .bind(group.post.0)
        .bind(group.id.0)
        .fetch_one(&mut *self.conn)
        .await
        .with_context(|| format!("fetching max depth of {group:?}"))?;
        row.try_get("max").context("retrieving the max field")
    }

    async fn max_rank(&mut self, group: ThreadGroup) -> anyhow::Result<Option<Rank>> {
        let row = sqlx::query(
            "SELECT MAX(rank) AS max FROM comments WHERE post_id = $1 AND group_id = $2",
        )
        .bind(group.post.0)
        .bind(group.id.0)
        .fetch_one(&mut *self.conn)
        .await
        .with_context(|| format!("fetching max rank of {group:?}"))?;
        row.try_get("max").context("retrieving the max field")
    }

    async fn sum_child_count(&mut self, group: ThreadGroup) -> anyhow::Result<i64> {
        // SUM of a BIGINT is a NUMERIC
        let row = sqlx::query(
            "
                SELECT COALESCE(SUM(child_count), 0)::BIGINT AS sum
                    FROM comments
                WHERE post_id = $1
                AND group_id = $2
            ",
        )
        .bind(group.post.0)
        .bind(group.id.0)
        .fetch_one(&mut *self.conn)
        .await
        .with_context(|| format!("summing child counts of {group:?}"))?;
        row.try_get("sum").context("retrieving the sum field")
    }

    async fn first_rank_after_subtree(
        &mut self,
        group: ThreadGroup,
        rank: Rank,
        depth: Depth,
    ) -> anyhow::Result<Option<Rank>> {
        let row = sqlx::query(
            "
                SELECT MIN(rank) AS min
                    FROM comments
                WHERE post_id = $1
                AND group_id = $2
                AND rank > $3
                AND depth <= $4
            ",
        )
        .bind(group.post.0)
        .bind(group.id.0)
        .bind(rank)
        .bind(depth)
        .fetch_one(&mut *self.conn)
        .await
        .with_context(|| format!("looking for the end of subtree at rank {rank} of {group:?}"))?;
        row.try_get("min").context("retrieving the min field")
    }

    async fn shift_ranks_above(
        &mut self,
        group: ThreadGroup,
        threshold: Rank,
        delta: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "
                UPDATE comments
                    SET rank = rank + $1
                WHERE post_id = $2
                AND group_id = $3
                AND rank > $4
            ",
        )
        .bind(delta)
        .bind(group.post.0)
        .bind(group.id.0)
        .bind(threshold)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("shifting ranks above {threshold} of {group:?}"))?;
        Ok(())
    }

    async fn insert_comment(&mut self, c: &Comment) -> anyhow::Result<()> {
        let res = sqlx::query(concat!(
            "INSERT INTO comments (",
            comment_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(c.id.0)
        .bind(c.post_id.0)
        .bind(c.author_id.0)
        .bind(c.parent_id.map(|p| p.0))
        .bind(c.group_id.0)
        .bind(c.rank)
        .bind(c.depth)
        .bind(c.child_count)
        .bind(&c.content)
        .bind(c.edited)
        .bind(c.status.as_str())
        .bind(c.created_at)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("inserting comment {:?}", c.id))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "insertion of comment {:?} affected {} rows",
            c.id,
            res.rows_affected()
        );
        Ok(())
    }

    async fn increment_child_count(&mut self, comment: CommentId) -> anyhow::Result<()> {
        let res = sqlx::query("UPDATE comments SET child_count = child_count + 1 WHERE id = $1")
            .bind(comment.0)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("incrementing child count of {comment:?}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "incrementing child count of {:?} affected {} rows",
            comment,
            res.rows_affected()
        );
        Ok(())
    }

    async fn get_comment(&mut self, comment: CommentId) -> anyhow::Result<Option<Comment>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            comment_columns!(),
            " FROM comments WHERE id = $1"
        ))
        .bind(comment.0)
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("fetching comment {comment:?}"))?;
        row.as_ref().map(comment_from_row).transpose()
    }

    async fn update_content(&mut self, comment: CommentId, content: &str) -> anyhow::Result<()> {
        let res = sqlx::query("UPDATE comments SET content = $1, edited = true WHERE id = $2")
            .bind(content)
            .bind(comment.0)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("updating contents of {comment:?}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "updating contents of {:?} affected {} rows",
            comment,
            res.rows_affected()
        );
        Ok(())
    }

    async fn set_status(&mut self, comment: CommentId, status: CommentStatus) -> anyhow::Result<()> {
        let res = sqlx::query("UPDATE comments SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(comment.0)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("setting status of {comment:?} to {status:?}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "setting status of {:?} affected {} rows",
            comment,
            res.rows_affected()
        );
        Ok(())
    }

    async fn list_by_group_ordered_by_rank(
        &mut self,
        group: ThreadGroup,
    ) -> anyhow::Result<Vec<Comment>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            comment_columns!(),
            " FROM comments WHERE post_id = $1 AND group_id = $2 ORDER BY rank"
        ))
        .bind(group.post.0)
        .bind(group.id.0)
        .fetch_all(&mut *self.conn)
        .await
        .with_context(|| format!("listing comments of {group:?}"))?;
        rows.iter().map(comment_from_row).collect()
    }
}
