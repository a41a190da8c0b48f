use std::collections::HashMap;

use anyhow::Context;

use crate::{Comment, CommentId, Db, Error, ThreadGroup};

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ThreadEntry {
    pub comment: Comment,

    /// 1-based position among the active comments of the group. Unlike the
    /// stored rank, it has no gaps left by deleted comments.
    pub position: usize,

    /// Whether some ancestor of this comment was deleted, in which case the
    /// comment is only reachable through its `parent_id`
    pub deleted_ancestor: bool,
}

/// Active comments of `group`, in depth-first order
pub async fn fetch_thread<D: Db>(
    db: &mut D,
    group: ThreadGroup,
) -> anyhow::Result<Result<Vec<ThreadEntry>, Error>> {
    if db
        .post_exists(group.post)
        .await
        .with_context(|| format!("checking that post {:?} exists", group.post))?
        != Some(true)
    {
        return Ok(Err(Error::PostNotFound(group.post)));
    }
    let comments = db
        .list_by_group_ordered_by_rank(group)
        .await
        .with_context(|| format!("listing comments of {group:?}"))?;
    Ok(Ok(thread_entries(comments)))
}

/// `comments` must hold the whole group, ordered by rank
pub fn thread_entries(comments: Vec<Comment>) -> Vec<ThreadEntry> {
    let nodes = comments
        .iter()
        .map(|c| (c.id, (c.is_active(), c.parent_id)))
        .collect::<HashMap<CommentId, (bool, Option<CommentId>)>>();
    let mut deleted_ancestor = HashMap::<CommentId, bool>::new();
    let mut entries = Vec::new();
    for c in comments {
        let flag = has_deleted_ancestor(&nodes, &mut deleted_ancestor, c.id);
        if c.is_active() {
            entries.push(ThreadEntry {
                position: entries.len() + 1,
                deleted_ancestor: flag,
                comment: c,
            });
        }
    }
    entries
}

fn has_deleted_ancestor(
    nodes: &HashMap<CommentId, (bool, Option<CommentId>)>,
    memo: &mut HashMap<CommentId, bool>,
    id: CommentId,
) -> bool {
    // walk up until reaching something already known, then fill the path back
    let mut path = Vec::new();
    let mut cur = id;
    let mut known = false;
    loop {
        if let Some(&res) = memo.get(&cur) {
            known = res || !nodes.get(&cur).map_or(true, |(active, _)| *active);
            break;
        }
        path.push(cur);
        match nodes.get(&cur).and_then(|(_, parent)| *parent) {
            None => break,
            Some(parent) => cur = parent,
        }
    }
    // `path` goes from `id` up to the topmost comment not in `memo`, and
    // `known` is the answer for that topmost comment
    for node in path.into_iter().rev() {
        memo.insert(node, known);
        let active = nodes.get(&node).map_or(true, |(active, _)| *active);
        known = known || !active;
    }
    memo[&id]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommentStatus, GroupId, PostId, UserId, Uuid};

    fn comment(rank: i64, parent: Option<&Comment>, active: bool) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            post_id: PostId::stub(),
            author_id: UserId::stub(),
            parent_id: parent.map(|p| p.id),
            group_id: GroupId(1),
            rank,
            depth: parent.map_or(1, |p| p.depth + 1),
            child_count: 0,
            content: String::from("hi"),
            edited: false,
            status: if active {
                CommentStatus::Active
            } else {
                CommentStatus::Deleted
            },
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn deleted_ancestors_are_surfaced() {
        let root = comment(1, None, true);
        let deleted = comment(2, Some(&root), false);
        let grandchild = comment(3, Some(&deleted), true);
        let great_grandchild = comment(4, Some(&grandchild), true);
        let sibling = comment(5, Some(&root), true);
        let entries = thread_entries(vec![
            root.clone(),
            deleted,
            grandchild.clone(),
            great_grandchild.clone(),
            sibling.clone(),
        ]);
        let summary = entries
            .iter()
            .map(|e| (e.comment.id, e.position, e.deleted_ancestor))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (root.id, 1, false),
                (grandchild.id, 2, true),
                (great_grandchild.id, 3, true),
                (sibling.id, 4, false),
            ]
        );
    }

    #[test]
    fn empty_group() {
        assert_eq!(thread_entries(Vec::new()), Vec::new());
    }
}
