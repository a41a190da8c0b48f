use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use quill_api::{AuthToken, PlacementStrategy, Uuid};
use structopt::StructOpt;

mod db;
mod error;
mod extractors;
mod feeds;
mod fuzz;
mod handlers;
mod transaction;

use error::Error;
use extractors::{AppState, PgPool};
use feeds::PostFeeds;
use transaction::{run_comment_op, CommentConfig, CommentOp};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, StructOpt)]
#[structopt(name = "quill-server", about = "Threaded comments for a blog")]
struct Opt {
    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Bearer token allowed to call the admin routes, which are disabled if unset
    #[structopt(long, env = "ADMIN_TOKEN")]
    admin_token: Option<Uuid>,

    /// How replies are placed in their thread: `aggregate` or `subtree-end`
    #[structopt(long, env = "PLACEMENT_STRATEGY", default_value = "aggregate")]
    placement: PlacementStrategy,

    #[structopt(long, default_value = "5")]
    max_conflict_retries: usize,

    #[structopt(long, default_value = "5000")]
    transaction_timeout_ms: u64,
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<PgPool> {
    Ok(PgPool::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(db_url)
            .await
            .with_context(|| format!("Error opening database {:?}", db_url))?,
    ))
}

pub async fn app(db: PgPool, admin_token: Option<AuthToken>, config: CommentConfig) -> Router {
    router(AppState {
        db,
        feeds: PostFeeds::new(),
        admin_token,
        config,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/admin/create-user", post(handlers::admin_create_user))
        .route("/api/auth", post(handlers::auth))
        .route("/api/unauth", post(handlers::unauth))
        .route("/api/whoami", get(handlers::whoami))
        .route("/api/posts", post(handlers::create_post))
        .route(
            "/api/posts/:post",
            get(handlers::fetch_post).delete(handlers::delete_post),
        )
        .route("/api/posts/:post/groups/:group", get(handlers::fetch_thread))
        .route("/api/comments", post(handlers::create_comment))
        .route(
            "/api/comments/:comment",
            get(handlers::fetch_comment)
                .post(handlers::edit_comment)
                .delete(handlers::delete_comment),
        )
        .route("/api/feed", get(handlers::comment_feed))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = Opt::from_args();

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&mut *db.acquire().await?)
        .await
        .context("running pending migrations")?;

    let config = CommentConfig {
        strategy: opt.placement,
        max_conflict_retries: opt.max_conflict_retries,
        transaction_timeout: Duration::from_millis(opt.transaction_timeout_ms),
    };
    if opt.admin_token.is_none() {
        tracing::info!("no admin token set, admin routes are disabled");
    }
    tracing::info!(strategy = %config.strategy, "placing replies");

    let app = app(db, opt.admin_token.map(AuthToken), config).await;
    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
