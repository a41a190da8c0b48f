use std::collections::{btree_map, BTreeMap, HashMap};

use chrono::SubsecRound;
use quill_api::{
    self as api, AuthToken, Comment, CommentId, Error, FeedMessage, NewComment, NewPost,
    NewSession, NewUser, PlacementStrategy, Post, PostId, ThreadEntry, ThreadGroup, UserId, Uuid,
};
use tokio::sync::mpsc;

mod mem_db;
#[cfg(test)]
mod tests;

pub use mem_db::MemDb;

/// Reference implementation of every server route, with all state in memory
pub struct MockServer {
    strategy: PlacementStrategy,
    users: BTreeMap<UserId, DbUser>,
    db: MemDb,
    feeds: Vec<(PostId, mpsc::UnboundedSender<FeedMessage>)>,
}

#[derive(Debug)]
struct DbUser {
    name: String,
    pass: String,
    pass_hash: String,
    sessions: HashMap<AuthToken, Device>,
}

#[derive(Debug)]
struct Device(String);

impl MockServer {
    pub fn new(strategy: PlacementStrategy) -> MockServer {
        MockServer {
            strategy,
            users: BTreeMap::new(),
            db: MemDb::default(),
            feeds: Vec::new(),
        }
    }

    /// Return name & pass for user number `id`
    pub fn test_get_user_info(&self, id: usize) -> (&str, &str) {
        let u = self
            .users
            .values()
            .nth(id)
            .unwrap_or_else(|| panic!("getting user {id} among {}", self.users.len()));
        (&u.name, &u.pass)
    }

    /// Return the current number of users
    pub fn test_num_users(&self) -> usize {
        self.users.len()
    }

    /// Return every stored comment of a post, deleted ones included
    pub fn test_comments_of(&self, post: PostId) -> Vec<Comment> {
        let mut res = self
            .db
            .comments
            .values()
            .filter(|c| c.post_id == post)
            .cloned()
            .collect::<Vec<_>>();
        res.sort_by_key(|c| (c.group_id, c.rank));
        res
    }

    fn relay(&mut self, msg: FeedMessage) {
        let post = msg.post_id();
        self.feeds
            .retain(|(p, f)| Some(*p) != post || f.send(msg.clone()).is_ok());
    }

    /// Runs `f` against a copy of the database, which replaces the real one
    /// only if `f` succeeds
    async fn transaction<T, F>(&mut self, f: F) -> Result<T, Error>
    where
        F: for<'a> FnOnce(
            &'a mut MemDb,
        ) -> futures::future::BoxFuture<'a, anyhow::Result<Result<T, Error>>>,
    {
        let mut staged = self.db.clone();
        match f(&mut staged).await {
            Ok(Ok(res)) => {
                self.db = staged;
                Ok(res)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::Unknown(format!("{e:#}"))),
        }
    }

    pub fn admin_create_user(&mut self, u: NewUser, password: String) -> Result<(), Error> {
        u.validate()?;

        if self.users.values().any(|db| db.name == u.name) {
            return Err(Error::NameAlreadyUsed(u.name));
        }

        match self.users.entry(u.id) {
            btree_map::Entry::Occupied(_) => Err(Error::UuidAlreadyUsed(u.id.0)),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(DbUser {
                    name: u.name,
                    pass: password,
                    pass_hash: u.initial_password_hash,
                    sessions: HashMap::new(),
                });
                Ok(())
            }
        }
    }

    pub fn auth(&mut self, s: NewSession) -> Result<AuthToken, Error> {
        s.validate()?;
        for u in self.users.values_mut() {
            if u.name == s.user {
                // tests (of which mock-server is a part of) don't actually use bcrypt
                if s.password != u.pass_hash {
                    return Err(Error::PermissionDenied);
                } else {
                    let tok = AuthToken(Uuid::new_v4());
                    u.sessions.insert(tok, Device(s.device));
                    return Ok(tok);
                }
            }
        }
        Err(Error::PermissionDenied)
    }

    fn resolve(&self, tok: AuthToken) -> Result<UserId, Error> {
        for (id, u) in self.users.iter() {
            if u.sessions.contains_key(&tok) {
                return Ok(*id);
            }
        }
        Err(Error::PermissionDenied)
    }

    pub fn unauth(&mut self, tok: AuthToken) -> Result<(), Error> {
        let user = self.resolve(tok)?;
        if let Some(u) = self.users.get_mut(&user) {
            u.sessions.remove(&tok);
        }
        Ok(())
    }

    pub fn whoami(&self, tok: AuthToken) -> Result<UserId, Error> {
        self.resolve(tok)
    }

    pub fn create_post(&mut self, tok: AuthToken, p: NewPost) -> Result<Post, Error> {
        let owner = self.resolve(tok)?;
        p.validate()?;
        if self.db.posts.contains_key(&p.id) {
            return Err(Error::UuidAlreadyUsed(p.id.0));
        }
        let post = Post {
            id: p.id,
            owner_id: owner,
            title: p.title,
            active: true,
            comment_count: 0,
            created_at: chrono::Utc::now().trunc_subsecs(6),
        };
        self.db.posts.insert(p.id, post.clone());
        Ok(post)
    }

    pub fn fetch_post(&self, id: PostId) -> Result<Post, Error> {
        match self.db.posts.get(&id) {
            Some(p) if p.active => Ok(p.clone()),
            _ => Err(Error::PostNotFound(id)),
        }
    }

    pub fn delete_post(&mut self, tok: AuthToken, id: PostId) -> Result<(), Error> {
        let user = self.resolve(tok)?;
        match self.db.posts.get_mut(&id) {
            Some(p) if p.active => {
                if p.owner_id != user {
                    return Err(Error::PermissionDenied);
                }
                p.active = false;
                Ok(())
            }
            _ => Err(Error::PostNotFound(id)),
        }
    }

    pub async fn create_comment(
        &mut self,
        tok: AuthToken,
        c: NewComment,
    ) -> Result<Comment, Error> {
        let user = self.resolve(tok)?;
        let strategy = self.strategy;
        let comment = self
            .transaction(move |db| {
                Box::pin(async move { api::create_comment(db, strategy, user, c).await })
            })
            .await?;
        self.relay(FeedMessage::NewComment(comment.clone()));
        Ok(comment)
    }

    pub async fn edit_comment(
        &mut self,
        tok: AuthToken,
        id: CommentId,
        content: String,
    ) -> Result<Comment, Error> {
        let user = self.resolve(tok)?;
        let comment = self
            .transaction(move |db| {
                Box::pin(async move { api::edit_comment(db, user, id, content).await })
            })
            .await?;
        self.relay(FeedMessage::EditedComment(comment.clone()));
        Ok(comment)
    }

    pub async fn delete_comment(&mut self, tok: AuthToken, id: CommentId) -> Result<Comment, Error> {
        let user = self.resolve(tok)?;
        let comment = self
            .transaction(move |db| {
                Box::pin(async move { api::soft_delete_comment(db, user, id).await })
            })
            .await?;
        self.relay(FeedMessage::DeletedComment(comment.clone()));
        Ok(comment)
    }

    pub fn fetch_comment(&self, id: CommentId) -> Result<Comment, Error> {
        self.db
            .comments
            .get(&id)
            .map(|c| c.clone().redacted())
            .ok_or(Error::CommentNotFound(id))
    }

    pub async fn fetch_thread(&mut self, group: ThreadGroup) -> Result<Vec<ThreadEntry>, Error> {
        self.transaction(move |db| Box::pin(async move { api::fetch_thread(db, group).await }))
            .await
    }

    pub fn comment_feed(&mut self, post: PostId) -> mpsc::UnboundedReceiver<FeedMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.feeds.push((post, sender));
        receiver
    }
}
