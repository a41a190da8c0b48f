#![cfg(test)]

use async_recursion::async_recursion;
use axum::{
    extract::{ws::Message, FromRequestParts},
    http::{self, request},
    Router,
};
use futures::StreamExt;
use quill_api::{
    AuthToken, Comment, CommentId, Error as ApiError, FeedMessage, GroupId, NewComment, NewPost,
    NewSession, NewUser, PlacementStrategy, Post, PostId, ThreadEntry, ThreadGroup, UserId, Uuid,
};
use quill_mock_server::MockServer;
use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path, time::Duration};
use sqlx::Row;
use tower::{Service, ServiceExt};

use crate::{db::PostgresDb, extractors::*, *};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    runtime.map(|r| postgresfixture::cluster::Cluster::new(data, r))
}

/// Spins up a throwaway postgres cluster with the migrations applied, and
/// hands a pool to it to `f`
fn with_test_db<F>(name: &str, f: F)
where
    F: FnOnce(tokio::runtime::Runtime, PgPool),
{
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt::try_init();
    }
    let lockfile = tempfile::tempfile().expect("creating tempfile");
    let datadir = tempfile::tempdir().expect("creating tempdir");
    let datadir_path: &Path = datadir.as_ref();
    let cluster = match build_pg_cluster(datadir_path) {
        Some(cluster) => cluster,
        None => {
            eprintln!("skipping {name}: postgresql seems to not be installed in path");
            return;
        }
    };
    let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
    let f = AssertUnwindSafe(f);
    postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
        let f = f;
        cluster.createdb("test_db").expect("creating test_db database");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed initializing tokio runtime");
        let pool = runtime.block_on(async move {
            let pool = create_sqlx_pool(&format!(
                "postgresql://?host={}&dbname=test_db",
                datadir_path
            ))
            .await
            .expect("creating sqlx pool");
            MIGRATOR
                .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                .await
                .expect("failed applying migrations");
            pool
        });
        (f.0)(runtime, pool)
    })
    .expect("coordinating spinup and shutdown of the pg cluster");
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            with_test_db(stringify!($name), |runtime, pool| {
                let runtime = AssertUnwindSafe(runtime);
                let pool = AssertUnwindSafe(pool);
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        // run the test
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            // cleanup
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            // several statements, only the simple query protocol takes them
                            let reset = include_str!("../reset-test-db.sql");
                            sqlx::Executor::execute(&mut *conn, reset)
                                .await
                                .expect("failed cleaning up database");
                        });
                        // resume the panics
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            });
        }
    };

    ( $name:ident, $fn:expr ) => {
        #[test]
        fn $name() {
            with_test_db(stringify!($name), |runtime, pool| {
                let () = runtime.block_on($fn(pool));
            });
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    CreateUser(NewUser),
    Auth {
        uid: usize,
        #[generator(bolero::generator::gen_with::<String>().len(1..100usize))]
        device: String,
    },
    Unauth {
        sid: usize,
    },
    Whoami {
        sid: usize,
    },
    CreatePost {
        sid: usize,
        post: NewPost,
    },
    FetchPost {
        post: usize,
    },
    DeletePost {
        sid: usize,
        post: usize,
    },
    CreateComment {
        sid: usize,
        id: CommentId,
        post: usize,
        parent: Option<usize>,
        #[generator(bolero::generator::gen_with::<String>().len(0..50usize))]
        content: String,
    },
    EditComment {
        sid: usize,
        comment: usize,
        #[generator(bolero::generator::gen_with::<String>().len(0..50usize))]
        content: String,
    },
    DeleteComment {
        sid: usize,
        comment: usize,
    },
    FetchComment {
        comment: usize,
    },
    FetchThread {
        post: usize,
        group: u8,
    },
}

async fn call<Req, Resp>(
    app: &mut Router,
    req: request::Request<axum::body::Body>,
    req_body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status == http::StatusCode::OK {
        if std::any::TypeId::of::<Resp>() == std::any::TypeId::of::<()>() {
            // the server returns an empty string in this situation, which does not parse properly with serde_json
            return Ok(serde_json::from_slice(b"null").unwrap());
        } else {
            return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
                panic!(
                    r#"
                        Failed parsing resp body!

                        The error is the following:
                        ---
                        {err}
                        ---

                        Response body is:
                        ---
                        {body:?}
                        ---

                        Request was:
                        ---
                        {req_body:?}
                        ---
                    "#
                )
            }));
        }
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<Uuid>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {token}")),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    call(app, req, body).await
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

fn epoch() -> quill_api::Time {
    std::time::UNIX_EPOCH.into()
}

// creation dates come from two different clocks
fn same_time_comment(mut c: Comment) -> Comment {
    c.created_at = epoch();
    c
}

fn same_time_post(mut p: Post) -> Post {
    p.created_at = epoch();
    p
}

fn same_time_thread(entries: Vec<ThreadEntry>) -> Vec<ThreadEntry> {
    entries
        .into_iter()
        .map(|mut e| {
            e.comment = same_time_comment(e.comment);
            e
        })
        .collect()
}

struct Session {
    app: AuthToken,
    mock: AuthToken,
}

struct ComparativeFuzzer {
    admin_token: Uuid,
    app: Router,
    mock: MockServer,
    sessions: Vec<Session>,
    posts: Vec<PostId>,
    comments: Vec<CommentId>,
}

impl ComparativeFuzzer {
    async fn new(pool: PgPool, strategy: PlacementStrategy) -> ComparativeFuzzer {
        let admin_token = Uuid::new_v4();
        let config = CommentConfig {
            strategy,
            ..CommentConfig::default()
        };
        let app = app(pool, Some(AuthToken(admin_token)), config).await;
        let mock = MockServer::new(strategy);
        ComparativeFuzzer {
            admin_token,
            app,
            mock,
            sessions: Vec::new(),
            posts: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Tokens to use for session `sid`, or unknown tokens if there is none yet
    fn session(&self, sid: usize) -> (Uuid, AuthToken) {
        match resize_int(sid, ..self.sessions.len()) {
            Some(sid) => (self.sessions[sid].app.0, self.sessions[sid].mock),
            None => {
                let tok = Uuid::new_v4();
                (tok, AuthToken(tok))
            }
        }
    }

    fn post(&self, post: usize) -> PostId {
        resize_int(post, ..self.posts.len())
            .map(|p| self.posts[p])
            .unwrap_or_else(PostId::stub)
    }

    fn comment(&self, comment: usize) -> CommentId {
        resize_int(comment, ..self.comments.len())
            .map(|c| self.comments[c])
            .unwrap_or_else(CommentId::stub)
    }

    #[async_recursion]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::CreateUser(new_user) => {
                // no hashing for tests
                let pass = new_user.initial_password_hash.clone();
                compare(
                    "CreateUser",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        "/api/admin/create-user",
                        Some(self.admin_token),
                        &new_user,
                    )
                    .await,
                    self.mock.admin_create_user(new_user, pass),
                )
            }
            FuzzOp::Auth { uid, device } => {
                if let Some(uid) = resize_int(uid, ..self.mock.test_num_users()) {
                    let (user, password) = self.mock.test_get_user_info(uid);
                    let session = NewSession {
                        user: String::from(user),
                        password: String::from(password),
                        device,
                    };
                    let app_tok =
                        run_on_app(&mut self.app, "POST", "/api/auth", None, &session).await;
                    let mock_tok = self.mock.auth(session);
                    if let (&Ok(app), &Ok(mock)) = (&app_tok, &mock_tok) {
                        self.sessions.push(Session { app, mock });
                    }
                    compare("Auth", app_tok.map(|_| ()), mock_tok.map(|_| ()));
                } else {
                    self.execute_fuzz_op(FuzzOp::CreateUser(NewUser {
                        id: UserId::stub(),
                        name: String::from("user"),
                        initial_password_hash: String::from("password"),
                    }))
                    .await;
                    self.execute_fuzz_op(FuzzOp::Auth { uid, device }).await;
                }
            }
            FuzzOp::Unauth { sid } => {
                let (app_tok, mock_tok) = self.session(sid);
                compare(
                    "Unauth",
                    run_on_app(&mut self.app, "POST", "/api/unauth", Some(app_tok), &()).await,
                    self.mock.unauth(mock_tok),
                )
            }
            FuzzOp::Whoami { sid } => {
                let (app_tok, mock_tok) = self.session(sid);
                compare(
                    "Whoami",
                    run_on_app(&mut self.app, "GET", "/api/whoami", Some(app_tok), &()).await,
                    self.mock.whoami(mock_tok),
                )
            }
            FuzzOp::CreatePost { sid, post } => {
                let (app_tok, mock_tok) = self.session(sid);
                let app_res: Result<Post, _> =
                    run_on_app(&mut self.app, "POST", "/api/posts", Some(app_tok), &post).await;
                let mock_res = self.mock.create_post(mock_tok, post);
                if let Ok(p) = &app_res {
                    self.posts.push(p.id);
                }
                compare(
                    "CreatePost",
                    app_res.map(same_time_post),
                    mock_res.map(same_time_post),
                )
            }
            FuzzOp::FetchPost { post } => {
                let post = self.post(post);
                let app_res: Result<Post, _> = run_on_app(
                    &mut self.app,
                    "GET",
                    &format!("/api/posts/{}", post.0),
                    None,
                    &(),
                )
                .await;
                compare(
                    "FetchPost",
                    app_res.map(same_time_post),
                    self.mock.fetch_post(post).map(same_time_post),
                )
            }
            FuzzOp::DeletePost { sid, post } => {
                let (app_tok, mock_tok) = self.session(sid);
                let post = self.post(post);
                compare(
                    "DeletePost",
                    run_on_app(
                        &mut self.app,
                        "DELETE",
                        &format!("/api/posts/{}", post.0),
                        Some(app_tok),
                        &(),
                    )
                    .await,
                    self.mock.delete_post(mock_tok, post),
                )
            }
            FuzzOp::CreateComment {
                sid,
                id,
                post,
                parent,
                content,
            } => {
                let (app_tok, mock_tok) = self.session(sid);
                let new = NewComment {
                    id,
                    post_id: self.post(post),
                    parent_id: parent.map(|p| self.comment(p)),
                    content,
                };
                let app_res: Result<Comment, _> =
                    run_on_app(&mut self.app, "POST", "/api/comments", Some(app_tok), &new).await;
                let mock_res = self.mock.create_comment(mock_tok, new).await;
                if let Ok(c) = &app_res {
                    self.comments.push(c.id);
                }
                compare(
                    "CreateComment",
                    app_res.map(same_time_comment),
                    mock_res.map(same_time_comment),
                )
            }
            FuzzOp::EditComment {
                sid,
                comment,
                content,
            } => {
                let (app_tok, mock_tok) = self.session(sid);
                let comment = self.comment(comment);
                let app_res: Result<Comment, _> = run_on_app(
                    &mut self.app,
                    "POST",
                    &format!("/api/comments/{}", comment.0),
                    Some(app_tok),
                    &content,
                )
                .await;
                let mock_res = self.mock.edit_comment(mock_tok, comment, content).await;
                compare(
                    "EditComment",
                    app_res.map(same_time_comment),
                    mock_res.map(same_time_comment),
                )
            }
            FuzzOp::DeleteComment { sid, comment } => {
                let (app_tok, mock_tok) = self.session(sid);
                let comment = self.comment(comment);
                let app_res: Result<Comment, _> = run_on_app(
                    &mut self.app,
                    "DELETE",
                    &format!("/api/comments/{}", comment.0),
                    Some(app_tok),
                    &(),
                )
                .await;
                let mock_res = self.mock.delete_comment(mock_tok, comment).await;
                compare(
                    "DeleteComment",
                    app_res.map(same_time_comment),
                    mock_res.map(same_time_comment),
                )
            }
            FuzzOp::FetchComment { comment } => {
                let comment = self.comment(comment);
                self.compare_comment(comment).await
            }
            FuzzOp::FetchThread { post, group } => {
                let group = ThreadGroup {
                    post: self.post(post),
                    id: GroupId(i64::from(group)),
                };
                let app_res: Result<Vec<ThreadEntry>, _> = run_on_app(
                    &mut self.app,
                    "GET",
                    &format!("/api/posts/{}/groups/{}", group.post.0, group.id.0),
                    None,
                    &(),
                )
                .await;
                let mock_res = self.mock.fetch_thread(group).await;
                compare(
                    "FetchThread",
                    app_res.map(same_time_thread),
                    mock_res.map(same_time_thread),
                )
            }
        }
    }

    async fn compare_comment(&mut self, comment: CommentId) {
        let app_res: Result<Comment, _> = run_on_app(
            &mut self.app,
            "GET",
            &format!("/api/comments/{}", comment.0),
            None,
            &(),
        )
        .await;
        compare(
            "FetchComment",
            app_res.map(same_time_comment),
            self.mock.fetch_comment(comment).map(same_time_comment),
        )
    }

    /// Every stored comment, with its rank and child count, must match
    async fn compare_all_comments(&mut self) {
        for comment in self.comments.clone() {
            self.compare_comment(comment).await;
        }
    }
}

do_sqlx_test!(
    compare_with_mock_aggregate,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool, PlacementStrategy::Aggregate).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
        fuzzer.compare_all_comments().await;
    }
);

do_sqlx_test!(
    compare_with_mock_subtree_end,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool, PlacementStrategy::SubtreeEnd).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
        fuzzer.compare_all_comments().await;
    }
);

/// A logged-in user and one of their posts, created through the app
struct TestPost {
    app: Router,
    token: Uuid,
    post: PostId,
}

impl TestPost {
    async fn new(app: Router, admin_token: Uuid) -> TestPost {
        let mut app = app;
        let user = NewUser::new(
            UserId(Uuid::new_v4()),
            String::from("alice"),
            String::from("password"),
        );
        let () = run_on_app(
            &mut app,
            "POST",
            "/api/admin/create-user",
            Some(admin_token),
            &user,
        )
        .await
        .expect("creating user");
        let token: AuthToken = run_on_app(
            &mut app,
            "POST",
            "/api/auth",
            None,
            &NewSession {
                user: String::from("alice"),
                password: String::from("password"),
                device: String::from("test"),
            },
        )
        .await
        .expect("logging in");
        let mut res = TestPost {
            app,
            token: token.0,
            post: PostId::stub(),
        };
        res.post = res.new_post().await;
        res
    }

    async fn new_post(&mut self) -> PostId {
        let post: Post = run_on_app(
            &mut self.app,
            "POST",
            "/api/posts",
            Some(self.token),
            &NewPost {
                id: PostId(Uuid::new_v4()),
                title: String::from("hello"),
            },
        )
        .await
        .expect("creating post");
        post.id
    }

    async fn comment_on(&self, post: PostId, parent: Option<CommentId>) -> Comment {
        let mut app = self.app.clone();
        run_on_app(
            &mut app,
            "POST",
            "/api/comments",
            Some(self.token),
            &NewComment {
                id: CommentId(Uuid::new_v4()),
                post_id: post,
                parent_id: parent,
                content: String::from("some comment"),
            },
        )
        .await
        .expect("creating comment")
    }

    async fn comment(&self, parent: Option<CommentId>) -> Comment {
        self.comment_on(self.post, parent).await
    }

    async fn thread(&self, group: GroupId) -> Vec<ThreadEntry> {
        let mut app = self.app.clone();
        run_on_app(
            &mut app,
            "GET",
            &format!("/api/posts/{}/groups/{}", self.post.0, group.0),
            None,
            &(),
        )
        .await
        .expect("fetching thread")
    }
}

fn assert_preorder(entries: &[ThreadEntry]) {
    let mut stack = Vec::<CommentId>::new();
    for e in entries {
        let c = &e.comment;
        match c.parent_id {
            None => assert!(stack.is_empty(), "root {:?} is not first", c.id),
            Some(parent) => {
                while stack.last() != Some(&parent) {
                    assert!(
                        stack.pop().is_some(),
                        "{:?} is not in the subtree of its parent",
                        c.id
                    );
                }
            }
        }
        assert_eq!(c.depth as usize, stack.len() + 1);
        stack.push(c.id);
    }
}

async fn concurrent_comments(pool: PgPool, strategy: PlacementStrategy) {
    let admin_token = Uuid::new_v4();
    let config = CommentConfig {
        strategy,
        ..CommentConfig::default()
    };
    let app = app(pool, Some(AuthToken(admin_token)), config).await;
    let t = TestPost::new(app, admin_token).await;

    // top-level comments racing for new groups
    let roots = futures::future::join_all((0..8).map(|_| t.comment(None))).await;
    let mut groups = roots.iter().map(|c| c.group_id.0).collect::<Vec<_>>();
    groups.sort();
    assert_eq!(groups, (1..=8).collect::<Vec<_>>());

    // replies racing inside one group, on two different levels
    let root = roots
        .iter()
        .find(|c| c.group_id == GroupId(1))
        .expect("no first group")
        .clone();
    let a = t.comment(Some(root.id)).await;
    let parents = [root.id, a.id];
    let replies = futures::future::join_all(
        (0..16).map(|i| t.comment(Some(parents[i % parents.len()]))),
    )
    .await;
    assert_eq!(replies.len(), 16);

    let thread = t.thread(GroupId(1)).await;
    assert_eq!(thread.len(), 18);
    for (i, e) in thread.iter().enumerate() {
        assert_eq!(e.position, i + 1);
        assert_eq!(e.comment.rank, i as i64 + 1, "ranks are not dense");
        assert!(!e.deleted_ancestor);
    }
    let root = &thread[0].comment;
    assert_eq!(root.child_count, 9);
    if strategy == PlacementStrategy::SubtreeEnd {
        assert_preorder(&thread);
    }
}

do_sqlx_test!(concurrent_comments_aggregate, |pool| async move {
    concurrent_comments(pool, PlacementStrategy::Aggregate).await
});

do_sqlx_test!(concurrent_comments_subtree_end, |pool| async move {
    concurrent_comments(pool, PlacementStrategy::SubtreeEnd).await
});

do_sqlx_test!(feed_relays_comments_of_followed_post, |pool: PgPool| async move {
    let admin_token = Uuid::new_v4();
    let state = AppState {
        db: pool.clone(),
        feeds: PostFeeds::new(),
        admin_token: Some(AuthToken(admin_token)),
        config: CommentConfig::default(),
    };
    let feeds = state.feeds.clone();
    let mut t = TestPost::new(router(state), admin_token).await;
    let other_post = t.new_post().await;

    let (write, mut from_server) = futures::channel::mpsc::unbounded::<Message>();
    let (to_server, read) = futures::channel::mpsc::unbounded::<Result<Message, axum::Error>>();
    to_server
        .unbounded_send(Ok(Message::Text(t.post.0.to_string())))
        .expect("sending post id");
    handlers::comment_feed_impl(write, read, pool.clone(), feeds.clone()).await;
    assert_eq!(
        from_server.next().await,
        Some(Message::Text(String::from("ok")))
    );
    assert_eq!(feeds.num_listeners(t.post).await, 1);

    let next_message = |msg: Option<Message>| match msg {
        Some(Message::Binary(json)) => {
            serde_json::from_slice::<FeedMessage>(&json).expect("parsing feed message")
        }
        msg => panic!("unexpected feed message {msg:?}"),
    };

    t.comment_on(other_post, None).await;
    let root = t.comment(None).await;
    assert_eq!(
        next_message(from_server.next().await),
        FeedMessage::NewComment(root.clone())
    );

    let deleted: Comment = run_on_app(
        &mut t.app,
        "DELETE",
        &format!("/api/comments/{}", root.id.0),
        Some(t.token),
        &(),
    )
    .await
    .expect("deleting comment");
    assert_eq!(
        next_message(from_server.next().await),
        FeedMessage::DeletedComment(deleted)
    );

    to_server
        .unbounded_send(Ok(Message::Text(String::from("ping"))))
        .expect("sending ping");
    assert_eq!(next_message(from_server.next().await), FeedMessage::Pong);

    std::mem::drop(to_server);
    let since = std::time::Instant::now();
    while feeds.num_listeners(t.post).await > 0 && since.elapsed() <= Duration::from_secs(1) {
        tokio::task::yield_now().await;
    }
    assert_eq!(feeds.num_listeners(t.post).await, 0);
});

do_sqlx_test!(feed_rejects_unknown_posts, |pool: PgPool| async move {
    let (write, mut from_server) = futures::channel::mpsc::unbounded::<Message>();
    let (to_server, read) = futures::channel::mpsc::unbounded::<Result<Message, axum::Error>>();
    to_server
        .unbounded_send(Ok(Message::Text(Uuid::new_v4().to_string())))
        .expect("sending post id");
    handlers::comment_feed_impl(write, read, pool, PostFeeds::new()).await;
    assert_eq!(
        from_server.next().await,
        Some(Message::Text(String::from("post not found")))
    );
});

/// A user and a post of theirs, written directly to the database
async fn user_and_post(pool: &PgPool, name: &str) -> (UserId, PostId) {
    let mut conn = pool.acquire().await.expect("getting connection");
    let user = UserId(Uuid::new_v4());
    db::create_user(
        &mut *conn,
        NewUser::new(user, String::from(name), String::from("password")),
    )
    .await
    .expect("creating user");
    let post = db::create_post(
        &mut *conn,
        user,
        NewPost {
            id: PostId(Uuid::new_v4()),
            title: String::from("hello"),
        },
    )
    .await
    .expect("creating post");
    (user, post.id)
}

fn new_comment(post: PostId, parent: Option<CommentId>) -> NewComment {
    NewComment {
        id: CommentId(Uuid::new_v4()),
        post_id: post,
        parent_id: parent,
        content: String::from("some comment"),
    }
}

/// Waits until some transaction of the database is waiting on a lock
async fn wait_for_lock_waiter(pool: &PgPool) {
    let mut conn = pool.acquire().await.expect("getting connection");
    let since = std::time::Instant::now();
    loop {
        let row = sqlx::query(
            "
                SELECT COUNT(*) AS waiting
                    FROM pg_stat_activity
                WHERE datname = current_database()
                AND wait_event_type = 'Lock'
            ",
        )
        .fetch_one(&mut *conn)
        .await
        .expect("listing lock waiters");
        let waiting: i64 = row.try_get("waiting").expect("retrieving the waiting field");
        if waiting > 0 {
            return;
        }
        assert!(
            since.elapsed() <= Duration::from_secs(5),
            "no transaction ever waited on a lock"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

do_sqlx_test!(transactions_time_out_on_locked_posts, |pool: PgPool| async move {
    let (user, post) = user_and_post(&pool, "bob").await;

    let config = CommentConfig {
        transaction_timeout: Duration::from_millis(200),
        ..CommentConfig::default()
    };
    let new = NewComment {
        id: CommentId(Uuid::new_v4()),
        post_id: post,
        parent_id: None,
        content: String::from("stuck"),
    };

    let mut locker = pool.begin().await.expect("starting locking transaction");
    sqlx::query("SELECT id FROM posts WHERE id = $1 FOR NO KEY UPDATE")
        .bind(post.0)
        .execute(&mut *locker)
        .await
        .expect("locking post");
    let res = run_comment_op(
        &pool,
        &config,
        CommentOp::Create {
            author: user,
            new: new.clone(),
        },
    )
    .await;
    assert!(
        matches!(res, Err(Error::Api(ApiError::Timeout))),
        "expected a timeout, got {res:?}"
    );
    locker.rollback().await.expect("releasing lock");

    let mut conn = pool.acquire().await.expect("getting connection");
    assert!(matches!(
        db::fetch_comment(&mut *conn, new.id).await,
        Err(Error::Api(ApiError::CommentNotFound(_)))
    ));
    std::mem::drop(conn);

    let comment = run_comment_op(&pool, &config, CommentOp::Create { author: user, new })
        .await
        .expect("creating comment once the lock is released");
    assert_eq!(comment.group_id, GroupId(1));
    assert_eq!(comment.rank, 1);
});

do_sqlx_test!(unique_violations_are_conflicts, |pool: PgPool| async move {
    let mut conn = pool.acquire().await.expect("getting connection");
    let id = Uuid::new_v4();
    for name in ["carol", "dave"] {
        let res = sqlx::query("INSERT INTO users (id, name, password_hash) VALUES ($1, $2, '')")
            .bind(id)
            .bind(name)
            .execute(&mut *conn)
            .await
            .map_err(anyhow::Error::from)
            .map_err(|e| e.context("inserting user"));
        match name {
            "carol" => assert!(res.is_ok()),
            _ => assert!(db::is_conflict(&res.expect_err("inserting duplicate id"))),
        }
    }
    let err = sqlx::query("SELECT * FROM no_such_table")
        .execute(&mut *conn)
        .await
        .map_err(anyhow::Error::from)
        .expect_err("querying missing table");
    assert!(!db::is_conflict(&err));
});

do_sqlx_test!(groups_of_a_post_are_written_concurrently, |pool: PgPool| async move {
    let (user, post) = user_and_post(&pool, "erin").await;
    let config = CommentConfig::default();
    let create = |new| CommentOp::Create { author: user, new };
    let first = run_comment_op(&pool, &config, create(new_comment(post, None)))
        .await
        .expect("creating first group");
    let second = run_comment_op(&pool, &config, create(new_comment(post, None)))
        .await
        .expect("creating second group");

    // any lock wait would exceed this
    let short = CommentConfig {
        transaction_timeout: Duration::from_millis(500),
        ..config
    };

    // a reply into the first group, left uncommitted
    let mut replying = pool.begin().await.expect("starting reply transaction");
    let pending_reply = quill_api::create_comment(
        &mut PostgresDb {
            conn: &mut *replying,
        },
        config.strategy,
        user,
        new_comment(post, Some(first.id)),
    )
    .await
    .expect("replying in first group")
    .expect("reply rejected");

    let reply = run_comment_op(&pool, &short, create(new_comment(post, Some(second.id))))
        .await
        .expect("replying in second group while the first one is busy");
    assert_eq!((reply.group_id, reply.rank, reply.depth), (second.group_id, 2, 2));
    let third = run_comment_op(&pool, &short, create(new_comment(post, None)))
        .await
        .expect("creating a group while the first one is busy");
    assert_eq!(third.group_id, GroupId(3));

    // a new group, left uncommitted
    let mut opening = pool.begin().await.expect("starting group transaction");
    quill_api::create_comment(
        &mut PostgresDb {
            conn: &mut *opening,
        },
        config.strategy,
        user,
        new_comment(post, None),
    )
    .await
    .expect("opening fourth group")
    .expect("top-level comment rejected");

    run_comment_op(&pool, &short, create(new_comment(post, Some(reply.id))))
        .await
        .expect("replying while a group is being opened");

    opening.rollback().await.expect("rolling back new group");
    replying.commit().await.expect("committing reply");

    let mut conn = pool.acquire().await.expect("getting connection");
    let first_reply = db::fetch_comment(&mut *conn, pending_reply.id)
        .await
        .expect("fetching committed reply");
    assert_eq!(first_reply.group_id, first.group_id);
    let post = db::fetch_post(&mut *conn, post).await.expect("fetching post");
    assert_eq!(post.comment_count, 6);
});

async fn duplicate_comment_ids(
    pool: PgPool,
    max_conflict_retries: usize,
) -> Result<Comment, Error> {
    let (user, post) = user_and_post(&pool, "frank").await;
    let config = CommentConfig {
        max_conflict_retries,
        ..CommentConfig::default()
    };
    let create = move |new| CommentOp::Create { author: user, new };
    let first = run_comment_op(&pool, &config, create(new_comment(post, None)))
        .await
        .expect("creating first group");
    let second = run_comment_op(&pool, &config, create(new_comment(post, None)))
        .await
        .expect("creating second group");

    let mut winner = pool.begin().await.expect("starting winning transaction");
    let taken = quill_api::create_comment(
        &mut PostgresDb { conn: &mut *winner },
        config.strategy,
        user,
        new_comment(post, Some(first.id)),
    )
    .await
    .expect("replying in first group")
    .expect("reply rejected");

    // same id, other group: blocks on the primary key until the winner commits
    let loser = tokio::spawn({
        let pool = pool.clone();
        let new = NewComment {
            id: taken.id,
            ..new_comment(post, Some(second.id))
        };
        async move { run_comment_op(&pool, &config, create(new)).await }
    });
    wait_for_lock_waiter(&pool).await;
    winner.commit().await.expect("committing winner");
    let res = loser.await.expect("joining losing transaction");

    let mut conn = pool.acquire().await.expect("getting connection");
    let second = db::fetch_comment(&mut *conn, second.id)
        .await
        .expect("fetching second group root");
    assert_eq!(second.child_count, 0, "losing transaction left partial state");
    res
}

do_sqlx_test!(exhausted_conflict_retries_are_internal_errors, |pool| async move {
    let res = duplicate_comment_ids(pool, 0).await;
    match res {
        Err(Error::Anyhow(e)) => assert!(db::is_conflict(&e), "not a conflict: {e:?}"),
        res => panic!("expected an internal error, got {res:?}"),
    }
});

do_sqlx_test!(conflicts_are_retried, |pool| async move {
    let res = duplicate_comment_ids(pool, CommentConfig::default().max_conflict_retries).await;
    assert!(
        matches!(res, Err(Error::Api(ApiError::UuidAlreadyUsed(_)))),
        "expected the retried attempt to see the committed id, got {res:?}"
    );
});

do_tokio_test!(fuzz_bearer_tokens, u128, |token: u128| async move {
    let token = Uuid::from_u128(token);
    for header in [format!("Bearer {token}"), format!("bEaReR {token}")] {
        let req = http::Request::builder()
            .uri("/")
            .header(http::header::AUTHORIZATION, header)
            .body(())
            .expect("building request");
        let res = PreAuth::from_request_parts(&mut req.into_parts().0, &()).await;
        assert!(matches!(res, Ok(PreAuth(AuthToken(t))) if t == token));
    }
    let req = http::Request::builder()
        .uri("/")
        .header(http::header::AUTHORIZATION, format!("Bearer {token} extra"))
        .body(())
        .expect("building request");
    let res = PreAuth::from_request_parts(&mut req.into_parts().0, &()).await;
    assert!(matches!(res, Err(Error::Api(ApiError::PermissionDenied))));
});
