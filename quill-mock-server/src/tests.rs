use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use quill_api::{CommentStatus, GroupId};

use super::*;

struct Fixture {
    mock: MockServer,
    tok: AuthToken,
    post: PostId,
}

impl Fixture {
    fn new(strategy: PlacementStrategy) -> Fixture {
        let mut mock = MockServer::new(strategy);
        let tok = add_user(&mut mock, "alice");
        let post = mock
            .create_post(
                tok,
                NewPost {
                    id: PostId(Uuid::new_v4()),
                    title: String::from("hello world"),
                },
            )
            .expect("creating post")
            .id;
        Fixture { mock, tok, post }
    }

    async fn try_comment(&mut self, parent: Option<CommentId>) -> Result<Comment, Error> {
        self.mock
            .create_comment(
                self.tok,
                NewComment {
                    id: CommentId(Uuid::new_v4()),
                    post_id: self.post,
                    parent_id: parent,
                    content: String::from("some comment"),
                },
            )
            .await
    }

    async fn comment(&mut self, parent: Option<&Comment>) -> Comment {
        self.try_comment(parent.map(|p| p.id))
            .await
            .expect("creating comment")
    }

    fn get(&self, c: &Comment) -> Comment {
        self.mock.fetch_comment(c.id).expect("fetching comment")
    }

    fn group(&self, id: GroupId) -> ThreadGroup {
        ThreadGroup {
            post: self.post,
            id,
        }
    }
}

fn add_user(mock: &mut MockServer, name: &str) -> AuthToken {
    mock.admin_create_user(
        NewUser::new(
            UserId(Uuid::new_v4()),
            String::from(name),
            String::from("password"),
        ),
        String::from("password"),
    )
    .expect("creating user");
    mock.auth(NewSession {
        user: String::from(name),
        password: String::from("password"),
        device: String::from("test"),
    })
    .expect("logging in")
}

fn ordering(c: &Comment) -> (GroupId, i64, i32) {
    (c.group_id, c.rank, c.depth)
}

#[tokio::test]
async fn scenarios() {
    let mut f = Fixture::new(PlacementStrategy::Aggregate);

    // A: first top-level comment opens the first group
    let c1 = f.comment(None).await;
    assert_eq!(ordering(&c1), (GroupId(1), 1, 1));
    assert_eq!(c1.parent_id, None);
    assert_eq!(c1.child_count, 0);

    // B: first reply
    let c2 = f.comment(Some(&c1)).await;
    assert_eq!(ordering(&c2), (GroupId(1), 2, 2));
    assert_eq!(f.get(&c1).child_count, 1);

    // C: sibling on the deepest level
    let c3 = f.comment(Some(&c1)).await;
    assert_eq!(ordering(&c3), (GroupId(1), 3, 2));
    assert_eq!(f.get(&c2).rank, 2);
    assert_eq!(f.get(&c1).child_count, 2);

    // D: new deepest level
    let c4 = f.comment(Some(&c2)).await;
    assert_eq!(ordering(&c4), (GroupId(1), 3, 3));
    assert_eq!(c4.rank, f.get(&c2).rank + 1);
    assert_eq!(f.get(&c3).rank, 4);
    assert_eq!(f.get(&c2).child_count, 1);

    // E: deleting c2 keeps c4 reachable and flags it
    let deleted = f.mock.delete_comment(f.tok, c2.id).await.unwrap();
    assert_eq!(deleted.status, CommentStatus::Deleted);
    assert_eq!(deleted.content, "");
    assert_eq!(ordering(&f.get(&c2)), ordering(&c2));
    assert_eq!(f.get(&c1).child_count, 2);
    let thread = f.mock.fetch_thread(f.group(GroupId(1))).await.unwrap();
    let summary = thread
        .iter()
        .map(|e| (e.comment.id, e.position, e.comment.rank, e.deleted_ancestor))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            (c1.id, 1, 1, false),
            (c4.id, 2, 3, true),
            (c3.id, 3, 4, false),
        ]
    );
    assert_eq!(thread[1].comment.parent_id, Some(c2.id));
    assert_eq!(f.mock.fetch_post(f.post).unwrap().comment_count, 3);

    // a second top-level comment opens another group
    let c5 = f.comment(None).await;
    assert_eq!(ordering(&c5), (GroupId(2), 1, 1));
}

#[tokio::test]
async fn aggregate_appends_interior_replies_at_group_end() {
    let mut f = Fixture::new(PlacementStrategy::Aggregate);
    let root = f.comment(None).await;
    let a = f.comment(Some(&root)).await;
    let b = f.comment(Some(&root)).await;
    let a1 = f.comment(Some(&a)).await;
    let a2 = f.comment(Some(&a)).await;
    let a1_deep = f.comment(Some(&a1)).await;
    // depth 3 is now an interior level: the reply lands after b
    let a3 = f.comment(Some(&a)).await;
    let order = f
        .mock
        .test_comments_of(f.post)
        .into_iter()
        .map(|c| c.id)
        .collect::<Vec<_>>();
    assert_eq!(order, vec![root.id, a.id, a1.id, a1_deep.id, a2.id, b.id, a3.id]);
}

#[tokio::test]
async fn subtree_end_keeps_exact_preorder() {
    let mut f = Fixture::new(PlacementStrategy::SubtreeEnd);
    let root = f.comment(None).await;
    let a = f.comment(Some(&root)).await;
    let b = f.comment(Some(&root)).await;
    let a1 = f.comment(Some(&a)).await;
    let a2 = f.comment(Some(&a)).await;
    let a1_deep = f.comment(Some(&a1)).await;
    let a3 = f.comment(Some(&a)).await;
    let order = f
        .mock
        .test_comments_of(f.post)
        .into_iter()
        .map(|c| c.id)
        .collect::<Vec<_>>();
    assert_eq!(order, vec![root.id, a.id, a1.id, a1_deep.id, a2.id, a3.id, b.id]);
}

#[tokio::test]
async fn failures_leave_no_partial_state() {
    let mut f = Fixture::new(PlacementStrategy::Aggregate);
    let root = f.comment(None).await;
    let reply = f.comment(Some(&root)).await;
    let before = f.mock.test_comments_of(f.post);

    // unknown parent
    let missing = CommentId(Uuid::new_v4());
    assert_eq!(
        f.try_comment(Some(missing)).await,
        Err(Error::ParentNotFound(missing))
    );

    // deleted parent
    f.mock.delete_comment(f.tok, reply.id).await.unwrap();
    assert_eq!(
        f.try_comment(Some(reply.id)).await,
        Err(Error::ParentNotFound(reply.id))
    );
    let before_after_delete = f.mock.test_comments_of(f.post);
    assert_eq!(before.len(), before_after_delete.len());

    // parent on another post
    let other = f
        .mock
        .create_post(
            f.tok,
            NewPost {
                id: PostId(Uuid::new_v4()),
                title: String::from("other"),
            },
        )
        .unwrap();
    let res = f
        .mock
        .create_comment(
            f.tok,
            NewComment {
                id: CommentId(Uuid::new_v4()),
                post_id: other.id,
                parent_id: Some(root.id),
                content: String::from("lost"),
            },
        )
        .await;
    assert_eq!(res, Err(Error::ParentNotFound(root.id)));

    // reused id
    let res = f
        .mock
        .create_comment(
            f.tok,
            NewComment {
                id: root.id,
                post_id: f.post,
                parent_id: None,
                content: String::from("again"),
            },
        )
        .await;
    assert_eq!(res, Err(Error::UuidAlreadyUsed(root.id.0)));

    // null bytes
    let res = f
        .mock
        .create_comment(
            f.tok,
            NewComment {
                id: CommentId(Uuid::new_v4()),
                post_id: f.post,
                parent_id: None,
                content: String::from("a\0b"),
            },
        )
        .await;
    assert_eq!(res, Err(Error::NullByteInString(String::from("a\0b"))));

    // deleted post
    f.mock.delete_post(f.tok, f.post).unwrap();
    assert_eq!(f.try_comment(None).await, Err(Error::PostNotFound(f.post)));
    assert_eq!(
        f.try_comment(Some(root.id)).await,
        Err(Error::PostNotFound(f.post))
    );

    assert_eq!(f.mock.test_comments_of(f.post), before_after_delete);
    assert_eq!(f.mock.test_comments_of(other.id), Vec::new());
    assert_eq!(f.get(&root).child_count, 1);
}

#[tokio::test]
async fn edits_and_deletes_check_authorship() {
    let mut f = Fixture::new(PlacementStrategy::Aggregate);
    let mallory = add_user(&mut f.mock, "mallory");
    let c = f.comment(None).await;

    assert_eq!(
        f.mock
            .edit_comment(mallory, c.id, String::from("pwned"))
            .await,
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        f.mock.delete_comment(mallory, c.id).await,
        Err(Error::PermissionDenied)
    );

    // editing twice with the same contents is stable
    let once = f
        .mock
        .edit_comment(f.tok, c.id, String::from("fixed typo"))
        .await
        .unwrap();
    let twice = f
        .mock
        .edit_comment(f.tok, c.id, String::from("fixed typo"))
        .await
        .unwrap();
    assert_eq!(once, twice);
    assert!(twice.edited);
    assert_eq!(twice.content, "fixed typo");
    assert_eq!(ordering(&twice), ordering(&c));
    assert_eq!(f.get(&c), twice);

    f.mock.delete_comment(f.tok, c.id).await.unwrap();
    assert_eq!(
        f.mock
            .edit_comment(f.tok, c.id, String::from("too late"))
            .await,
        Err(Error::CommentNotFound(c.id))
    );
    assert_eq!(
        f.mock.delete_comment(f.tok, c.id).await,
        Err(Error::CommentNotFound(c.id))
    );
    assert_eq!(f.mock.fetch_post(f.post).unwrap().comment_count, 0);
}

#[tokio::test]
async fn feed_relays_committed_changes_of_the_followed_post() {
    let mut f = Fixture::new(PlacementStrategy::Aggregate);
    let mut feed = f.mock.comment_feed(f.post);
    let mut other_feed = f.mock.comment_feed(PostId(Uuid::new_v4()));

    let c = f.comment(None).await;
    assert!(f.try_comment(Some(CommentId(Uuid::new_v4()))).await.is_err());
    let edited = f
        .mock
        .edit_comment(f.tok, c.id, String::from("edited"))
        .await
        .unwrap();

    assert_eq!(feed.try_recv().unwrap(), FeedMessage::NewComment(c));
    assert_eq!(feed.try_recv().unwrap(), FeedMessage::EditedComment(edited));
    assert!(feed.try_recv().is_err());
    assert!(other_feed.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_replies_get_distinct_ranks() {
    let mut f = Fixture::new(PlacementStrategy::Aggregate);
    let root_id = f.comment(None).await.id;
    let (tok, post) = (f.tok, f.post);
    let mock = Arc::new(tokio::sync::Mutex::new(f.mock));
    let tasks = (0..16)
        .map(|_| {
            let mock = mock.clone();
            tokio::spawn(async move {
                mock.lock()
                    .await
                    .create_comment(
                        tok,
                        NewComment {
                            id: CommentId(Uuid::new_v4()),
                            post_id: post,
                            parent_id: Some(root_id),
                            content: String::from("me first"),
                        },
                    )
                    .await
                    .expect("creating reply")
            })
        })
        .collect::<Vec<_>>();
    let mut ranks = Vec::new();
    for t in tasks {
        ranks.push(t.await.expect("joining reply task").rank);
    }
    ranks.sort();
    assert_eq!(ranks, (2..=17).collect::<Vec<i64>>());
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum Op {
    TopLevel,
    Reply { to: usize },
    Edit { which: usize },
    Delete { which: usize },
}

/// Checks every invariant that must hold for any strategy, and pre-order if
/// `exact` is set
fn check_post(comments: &[Comment], groups: &HashMap<CommentId, GroupId>, exact: bool) {
    let by_id = comments
        .iter()
        .map(|c| (c.id, c))
        .collect::<HashMap<_, _>>();
    let mut by_group = HashMap::<GroupId, Vec<&Comment>>::new();
    for c in comments {
        by_group.entry(c.group_id).or_default().push(c);

        // group ids never change
        assert_eq!(groups.get(&c.id), Some(&c.group_id), "group of {:?}", c.id);

        // depth consistency
        match c.parent_id {
            None => assert_eq!(c.depth, 1),
            Some(p) => {
                let p = by_id[&p];
                assert_eq!(c.depth, p.depth + 1);
                assert_eq!(c.group_id, p.group_id);
            }
        }

        // child counts include deleted replies
        let children = comments
            .iter()
            .filter(|other| other.parent_id == Some(c.id))
            .count();
        assert_eq!(c.child_count, children as i64);
    }

    for (group, members) in by_group {
        // density over stored rows, members are sorted by rank
        let ranks = members.iter().map(|c| c.rank).collect::<Vec<_>>();
        let expected = (1..=members.len() as i64).collect::<Vec<_>>();
        assert_eq!(ranks, expected, "ranks of group {group:?}");
        assert_eq!(members[0].parent_id, None);

        if exact {
            let mut stack = Vec::<CommentId>::new();
            for c in members {
                while stack.last().is_some() && stack.last().copied() != c.parent_id {
                    stack.pop();
                }
                assert_eq!(
                    stack.last().copied(),
                    c.parent_id,
                    "{:?} is not right after its parent's subtree",
                    c.id
                );
                stack.push(c.id);
            }
        }
    }
}

async fn run_ops(strategy: PlacementStrategy, ops: Vec<Op>) {
    let mut f = Fixture::new(strategy);
    let mut created = Vec::<CommentId>::new();
    let mut groups = HashMap::new();
    for op in ops {
        match op {
            Op::TopLevel => {
                let c = f.comment(None).await;
                created.push(c.id);
                groups.insert(c.id, c.group_id);
            }
            Op::Reply { to } if !created.is_empty() => {
                let parent = f.mock.fetch_comment(created[to % created.len()]).unwrap();
                match f.try_comment(Some(parent.id)).await {
                    Ok(c) => {
                        assert!(parent.is_active());
                        assert_eq!(c.depth, parent.depth + 1);
                        created.push(c.id);
                        groups.insert(c.id, c.group_id);
                    }
                    Err(e) => {
                        assert!(!parent.is_active());
                        assert_eq!(e, Error::ParentNotFound(parent.id));
                    }
                }
            }
            Op::Edit { which } if !created.is_empty() => {
                let c = f.mock.fetch_comment(created[which % created.len()]).unwrap();
                match f.mock.edit_comment(f.tok, c.id, String::from("edit")).await {
                    Ok(edited) => {
                        assert_eq!(ordering(&edited), ordering(&c));
                        assert!(edited.edited);
                    }
                    Err(e) => assert_eq!(e, Error::CommentNotFound(c.id)),
                }
            }
            Op::Delete { which } if !created.is_empty() => {
                let id = created[which % created.len()];
                let was_active = f.mock.fetch_comment(id).unwrap().is_active();
                assert_eq!(f.mock.delete_comment(f.tok, id).await.is_ok(), was_active);
            }
            _ => (),
        }
        let comments = f.mock.test_comments_of(f.post);
        check_post(&comments, &groups, strategy == PlacementStrategy::SubtreeEnd);
        let active = comments.iter().filter(|c| c.is_active()).count();
        assert_eq!(
            f.mock.fetch_post(f.post).unwrap().comment_count,
            active as i64
        );
        for group in groups.values().collect::<std::collections::HashSet<_>>() {
            let thread = f.mock.fetch_thread(f.group(*group)).await.unwrap();
            let positions = thread.iter().map(|e| e.position).collect::<Vec<_>>();
            assert_eq!(positions, (1..=thread.len()).collect::<Vec<_>>());
            assert!(thread.iter().all(|e| e.comment.is_active()));
        }
    }
}

fn check_random_ops(strategy: PlacementStrategy) {
    let runtime = AssertUnwindSafe(
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed initializing tokio runtime"),
    );
    bolero::check!()
        .with_generator(bolero::generator::gen_with::<Vec<Op>>().len(1..60usize))
        .cloned()
        .for_each(move |ops| runtime.block_on(run_ops(strategy, ops)));
}

#[test]
fn random_ops_with_aggregate_placement() {
    check_random_ops(PlacementStrategy::Aggregate);
}

#[test]
fn random_ops_with_subtree_end_placement() {
    check_random_ops(PlacementStrategy::SubtreeEnd);
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum Shape {
    /// Every reply answers the root
    Flat(u8),
    /// Every reply answers the previous comment
    Chain(u8),
}

#[test]
fn aggregate_placement_is_exact_on_simple_shapes() {
    let runtime = AssertUnwindSafe(
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed initializing tokio runtime"),
    );
    bolero::check!()
        .with_type::<Shape>()
        .cloned()
        .for_each(move |shape| {
            runtime.block_on(async move {
                let mut f = Fixture::new(PlacementStrategy::Aggregate);
                let root = f.comment(None).await;
                let mut groups = HashMap::from([(root.id, root.group_id)]);
                let mut last = root.clone();
                let (replies, flat) = match shape {
                    Shape::Flat(n) => (n, true),
                    Shape::Chain(n) => (n, false),
                };
                for _ in 0..(replies % 32) {
                    let parent = if flat { root.clone() } else { last.clone() };
                    last = f.comment(Some(&parent)).await;
                    groups.insert(last.id, last.group_id);
                }
                check_post(&f.mock.test_comments_of(f.post), &groups, true);
            })
        });
}
