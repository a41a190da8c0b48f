use anyhow::Context;
use axum::{
    extract::{ws::Message, Path, State, WebSocketUpgrade},
    Json,
};
use futures::{SinkExt, StreamExt};
use quill_api::{
    self as api, AuthToken, Comment, CommentId, FeedMessage, GroupId, NewComment, NewPost,
    NewSession, NewUser, Post, PostId, ThreadEntry, ThreadGroup, UserId, Uuid,
};

use crate::{
    db::{self, PostgresDb},
    extractors::*,
    run_comment_op, CommentConfig, CommentOp, Error, PostFeeds,
};

pub async fn admin_create_user(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Json(data): Json<NewUser>,
) -> Result<(), Error> {
    data.validate()?;
    db::create_user(&mut *conn, data).await
}

pub async fn auth(
    mut conn: PgConn,
    Json(data): Json<NewSession>,
) -> Result<Json<AuthToken>, Error> {
    data.validate()?;
    Ok(Json(
        db::login_user(&mut *conn, &data)
            .await
            .context("logging user in")?
            .ok_or(Error::permission_denied())?,
    ))
}

pub async fn unauth(user: PreAuth, mut conn: PgConn) -> Result<(), Error> {
    match db::logout_user(&mut *conn, &user.0).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::permission_denied()),
        Err(e) => Err(Error::Anyhow(e)),
    }
}

pub async fn whoami(Auth(user): Auth) -> Json<UserId> {
    Json(user)
}

pub async fn create_post(
    Auth(user): Auth,
    mut conn: PgConn,
    Json(data): Json<NewPost>,
) -> Result<Json<Post>, Error> {
    data.validate()?;
    Ok(Json(db::create_post(&mut *conn, user, data).await?))
}

pub async fn fetch_post(mut conn: PgConn, Path(post): Path<PostId>) -> Result<Json<Post>, Error> {
    Ok(Json(db::fetch_post(&mut *conn, post).await?))
}

pub async fn delete_post(
    Auth(user): Auth,
    mut conn: PgConn,
    Path(post): Path<PostId>,
) -> Result<(), Error> {
    db::delete_post(&mut *conn, user, post).await
}

pub async fn create_comment(
    Auth(user): Auth,
    State(pool): State<PgPool>,
    State(feeds): State<PostFeeds>,
    State(config): State<CommentConfig>,
    Json(data): Json<NewComment>,
) -> Result<Json<Comment>, Error> {
    let comment = run_comment_op(
        &pool,
        &config,
        CommentOp::Create {
            author: user,
            new: data,
        },
    )
    .await?;
    feeds.relay(FeedMessage::NewComment(comment.clone())).await;
    Ok(Json(comment))
}

pub async fn edit_comment(
    Auth(user): Auth,
    State(pool): State<PgPool>,
    State(feeds): State<PostFeeds>,
    State(config): State<CommentConfig>,
    Path(id): Path<CommentId>,
    Json(content): Json<String>,
) -> Result<Json<Comment>, Error> {
    let comment = run_comment_op(&pool, &config, CommentOp::Edit { user, id, content }).await?;
    feeds
        .relay(FeedMessage::EditedComment(comment.clone()))
        .await;
    Ok(Json(comment))
}

pub async fn delete_comment(
    Auth(user): Auth,
    State(pool): State<PgPool>,
    State(feeds): State<PostFeeds>,
    State(config): State<CommentConfig>,
    Path(id): Path<CommentId>,
) -> Result<Json<Comment>, Error> {
    let comment = run_comment_op(&pool, &config, CommentOp::Delete { user, id }).await?;
    feeds
        .relay(FeedMessage::DeletedComment(comment.clone()))
        .await;
    Ok(Json(comment))
}

pub async fn fetch_comment(
    mut conn: PgConn,
    Path(id): Path<CommentId>,
) -> Result<Json<Comment>, Error> {
    Ok(Json(db::fetch_comment(&mut *conn, id).await?))
}

pub async fn fetch_thread(
    State(pool): State<PgPool>,
    Path((post, group)): Path<(PostId, i64)>,
) -> Result<Json<Vec<ThreadEntry>>, Error> {
    let group = ThreadGroup {
        post,
        id: GroupId(group),
    };
    // the existence check and the listing must see the same snapshot
    let mut tx = pool.begin().await?;
    let res = api::fetch_thread(&mut PostgresDb { conn: &mut *tx }, group)
        .await
        .with_context(|| format!("fetching thread of {group:?}"))?;
    tx.commit().await.context("committing thread fetch")?;
    Ok(Json(res?))
}

pub async fn comment_feed(
    ws: WebSocketUpgrade,
    State(db): State<PgPool>,
    State(feeds): State<PostFeeds>,
) -> Result<axum::response::Response, Error> {
    Ok(ws.on_upgrade(move |sock| {
        let (write, read) = sock.split();
        comment_feed_impl(write, read, db, feeds)
    }))
}

pub async fn comment_feed_impl<W, R>(mut write: W, mut read: R, db: PgPool, feeds: PostFeeds)
where
    W: 'static + Send + Unpin + futures::Sink<Message>,
    <W as futures::Sink<Message>>::Error: Send,
    R: 'static + Send + Unpin + futures::Stream<Item = Result<Message, axum::Error>>,
{
    tracing::debug!("comment feed websocket connected");
    if let Some(Ok(Message::Text(post))) = read.next().await {
        if let Ok(post) = Uuid::try_from(&post as &str) {
            let post = PostId(post);
            if let Ok(mut conn) = db.acquire().await {
                if db::fetch_post(&mut *conn, post).await.is_ok() {
                    // give the connection back before following the feed
                    std::mem::drop(conn);
                    if write.send(Message::Text(String::from("ok"))).await.is_ok() {
                        tracing::debug!(?post, "comment feed websocket following post");
                        feeds.add_for_post(post, write, read).await;
                        return;
                    }
                }
            }
        }
        tracing::debug!(?post, "comment feed websocket for unknown post");
        let _ = write
            .send(Message::Text(String::from("post not found")))
            .await;
    }
}
