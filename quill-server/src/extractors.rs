use std::ops::{Deref, DerefMut};

use anyhow::Context;
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{self, request},
};
use quill_api::{AuthToken, UserId, Uuid};

use crate::{db, CommentConfig, Error, PostFeeds};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: PgPool,
    pub feeds: PostFeeds,
    pub admin_token: Option<AuthToken>,
    pub config: CommentConfig,
}

/// Connection pool handed to handlers through the app state
#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn acquire(&self) -> Result<PgConn, Error> {
        let conn = self.0.acquire().await.context("acquiring db connection")?;
        Ok(PgConn(conn))
    }

    /// Comment transactions run at the default READ COMMITTED level, and rely
    /// on row locks taken through `Db::lock_post` and `Db::lock_group`
    pub async fn begin(&self) -> anyhow::Result<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.0.begin().await.context("starting db transaction")
    }

    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }
}

/// One pooled connection, held for the duration of the request
pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

#[async_trait]
impl FromRequestParts<AppState> for PgConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<PgConn, Error> {
        state.db.acquire().await
    }
}

impl Deref for PgConn {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &sqlx::PgConnection {
        &self.0
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut sqlx::PgConnection {
        &mut self.0
    }
}

/// `Authorization: Bearer <uuid>`, with a case-insensitive scheme
fn bearer_token(req: &request::Parts) -> Option<AuthToken> {
    let header = req.headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Uuid::try_parse(token).ok().map(AuthToken)
}

/// A well-formed bearer token, not yet checked against the sessions
pub struct PreAuth(pub AuthToken);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        bearer_token(req)
            .map(PreAuth)
            .ok_or_else(Error::permission_denied)
    }
}

/// The user owning the session of the bearer token
pub struct Auth(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let PreAuth(token) = PreAuth::from_request_parts(req, state).await?;
        let mut conn = state.db.acquire().await?;
        let user = db::recover_session(&mut conn, token).await?;
        tracing::trace!(?user, "authenticated request");
        Ok(Auth(user))
    }
}

/// Bearer token equal to the configured admin token. Always rejected when the
/// server runs without one.
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<AdminAuth, Error> {
        match (bearer_token(req), state.admin_token) {
            (Some(token), Some(admin)) if token == admin => Ok(AdminAuth),
            (_, None) => {
                tracing::debug!("rejecting admin request, admin routes are disabled");
                Err(Error::permission_denied())
            }
            _ => Err(Error::permission_denied()),
        }
    }
}
