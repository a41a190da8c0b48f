//! Placement of new comments in the depth-first order of their thread group.
//!
//! Every group is stored flat: each comment carries its `rank` in the
//! pre-order traversal of the reply tree rooted at the group's top-level
//! comment. Placing a reply never walks the tree. It only reads a couple of
//! aggregates over the group, derives where the reply falls in the pre-order
//! sequence, and shifts the suffix of ranks that comes after that slot.

use std::{cmp::Ordering, fmt, str::FromStr};

use anyhow::Context;

use crate::{Comment, Db, Depth, GroupId, PostId, Rank};

pub const ROOT_RANK: Rank = 1;
pub const ROOT_DEPTH: Depth = 1;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct ThreadGroup {
    pub post: PostId,
    pub id: GroupId,
}

/// How the rank of a reply is derived from the state of its group
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategy {
    /// Compares the reply's depth with the deepest level of the group, and
    /// uses the parent's own child count or the group-wide child count sum as
    /// an estimate of the parent's subtree span.
    ///
    /// The estimates are only exact while the group keeps a simple shape:
    /// direct children are counted instead of descendants, and replies to an
    /// interior level are appended at the end of the group.
    #[default]
    Aggregate,

    /// Looks up the first comment after the parent that is not one of its
    /// descendants, and inserts the reply right before it. Always yields an
    /// exact pre-order.
    SubtreeEnd,
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementStrategy::Aggregate => write!(f, "aggregate"),
            PlacementStrategy::SubtreeEnd => write!(f, "subtree-end"),
        }
    }
}

impl FromStr for PlacementStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<PlacementStrategy> {
        match s {
            "aggregate" => Ok(PlacementStrategy::Aggregate),
            "subtree-end" => Ok(PlacementStrategy::SubtreeEnd),
            _ => Err(anyhow::anyhow!(
                "unknown placement strategy {s:?}, expected aggregate or subtree-end"
            )),
        }
    }
}

/// Every rank strictly above `above` must be increased by `by`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RankShift {
    pub above: Rank,
    pub by: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Placement {
    pub group: GroupId,
    pub rank: Rank,
    pub depth: Depth,

    /// Must be applied to the already-stored comments of the group before
    /// inserting the new one
    pub shift: Option<RankShift>,
}

/// A new top-level comment opens a new group on the post
pub fn place_root(max_group: Option<GroupId>) -> Placement {
    Placement {
        group: GroupId(max_group.map_or(0, |g| g.0) + 1),
        rank: ROOT_RANK,
        depth: ROOT_DEPTH,
        shift: None,
    }
}

/// `max_depth` is the deepest level of the group and `child_sum` the sum of
/// the child counts of all its comments, both read before the insertion
pub fn place_reply_by_aggregates(parent: &Comment, max_depth: Depth, child_sum: i64) -> Placement {
    let depth = parent.depth + 1;
    let (rank, shift) = match depth.cmp(&max_depth) {
        Ordering::Less => {
            // Every comment but the root was counted once in its parent's
            // child count, so this is right after the last comment
            (ROOT_RANK + child_sum + 1, None)
        }
        Ordering::Equal => {
            let span_end = parent.rank + parent.child_count;
            (span_end + 1, Some(RankShift { above: span_end, by: 1 }))
        }
        Ordering::Greater => (
            parent.rank + 1,
            Some(RankShift {
                above: parent.rank,
                by: 1,
            }),
        ),
    };
    Placement {
        group: parent.group_id,
        rank,
        depth,
        shift,
    }
}

/// `subtree_end` is the first rank after the parent that does not belong to
/// its subtree, if any, and `max_rank` the last rank of the group
pub fn place_reply_at_subtree_end(
    parent: &Comment,
    subtree_end: Option<Rank>,
    max_rank: Rank,
) -> Placement {
    let (rank, shift) = match subtree_end {
        Some(end) => (
            end,
            Some(RankShift {
                above: end - 1,
                by: 1,
            }),
        ),
        None => (max_rank + 1, None),
    };
    Placement {
        group: parent.group_id,
        rank,
        depth: parent.depth + 1,
        shift,
    }
}

/// Computes where a new comment goes. Must be called with the group (or, for
/// top-level comments, the post) locked, and with `parent` read after taking
/// the lock.
pub async fn place<D: Db>(
    db: &mut D,
    strategy: PlacementStrategy,
    post: PostId,
    parent: Option<&Comment>,
) -> anyhow::Result<Placement> {
    let parent = match parent {
        None => {
            let max_group = db
                .max_group_id(post)
                .await
                .with_context(|| format!("fetching max group id of post {post:?}"))?;
            return Ok(place_root(max_group));
        }
        Some(parent) => parent,
    };
    let group = ThreadGroup {
        post,
        id: parent.group_id,
    };
    let placement = match strategy {
        PlacementStrategy::Aggregate => {
            let max_depth = db
                .max_depth(group)
                .await
                .with_context(|| format!("fetching max depth of {group:?}"))?
                .unwrap_or(parent.depth);
            let child_sum = db
                .sum_child_count(group)
                .await
                .with_context(|| format!("summing child counts of {group:?}"))?;
            place_reply_by_aggregates(parent, max_depth, child_sum)
        }
        PlacementStrategy::SubtreeEnd => {
            let subtree_end = db
                .first_rank_after_subtree(group, parent.rank, parent.depth)
                .await
                .with_context(|| {
                    format!("looking for the end of the subtree of {:?}", parent.id)
                })?;
            let max_rank = db
                .max_rank(group)
                .await
                .with_context(|| format!("fetching max rank of {group:?}"))?
                .unwrap_or(parent.rank);
            place_reply_at_subtree_end(parent, subtree_end, max_rank)
        }
    };
    tracing::debug!(
        ?group,
        parent = ?parent.id,
        %strategy,
        rank = placement.rank,
        depth = placement.depth,
        shift = ?placement.shift,
        "placed reply"
    );
    Ok(placement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommentId, CommentStatus, UserId, Uuid};

    fn comment(group: i64, rank: Rank, depth: Depth, child_count: i64) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            post_id: PostId::stub(),
            author_id: UserId::stub(),
            parent_id: None,
            group_id: GroupId(group),
            rank,
            depth,
            child_count,
            content: String::new(),
            edited: false,
            status: CommentStatus::Active,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn first_group_of_a_post_is_one() {
        assert_eq!(
            place_root(None),
            Placement {
                group: GroupId(1),
                rank: 1,
                depth: 1,
                shift: None,
            }
        );
        assert_eq!(place_root(Some(GroupId(4))).group, GroupId(5));
    }

    #[test]
    fn first_reply_opens_a_deeper_level() {
        let root = comment(1, 1, 1, 0);
        assert_eq!(
            place_reply_by_aggregates(&root, 1, 0),
            Placement {
                group: GroupId(1),
                rank: 2,
                depth: 2,
                shift: Some(RankShift { above: 1, by: 1 }),
            }
        );
    }

    #[test]
    fn sibling_on_the_deepest_level_goes_after_the_parent_span() {
        // root with one reply at rank 2
        let root = comment(1, 1, 1, 1);
        assert_eq!(
            place_reply_by_aggregates(&root, 2, 1),
            Placement {
                group: GroupId(1),
                rank: 3,
                depth: 2,
                shift: Some(RankShift { above: 2, by: 1 }),
            }
        );
    }

    #[test]
    fn reply_below_the_deepest_level_goes_right_after_its_parent() {
        // root(1) -> a(2), b(3); replying to a
        let a = comment(1, 2, 2, 0);
        assert_eq!(
            place_reply_by_aggregates(&a, 2, 2),
            Placement {
                group: GroupId(1),
                rank: 3,
                depth: 3,
                shift: Some(RankShift { above: 2, by: 1 }),
            }
        );
    }

    #[test]
    fn reply_to_an_interior_level_is_appended() {
        // root(1) -> a(2) -> c(3), b(4); replying to root again
        let root = comment(1, 1, 1, 2);
        assert_eq!(
            place_reply_by_aggregates(&root, 3, 3),
            Placement {
                group: GroupId(1),
                rank: 5,
                depth: 2,
                shift: None,
            }
        );
    }

    #[test]
    fn subtree_end_inserts_before_the_next_non_descendant() {
        // root(1) -> a(2) -> c(3), b(4); replying to a
        let a = comment(1, 2, 2, 1);
        assert_eq!(
            place_reply_at_subtree_end(&a, Some(4), 4),
            Placement {
                group: GroupId(1),
                rank: 4,
                depth: 3,
                shift: Some(RankShift { above: 3, by: 1 }),
            }
        );
        // replying to b, which ends the group
        let b = comment(1, 4, 2, 0);
        assert_eq!(
            place_reply_at_subtree_end(&b, None, 4),
            Placement {
                group: GroupId(1),
                rank: 5,
                depth: 3,
                shift: None,
            }
        );
    }

    #[test]
    fn strategy_names() {
        for s in [PlacementStrategy::Aggregate, PlacementStrategy::SubtreeEnd] {
            assert_eq!(s.to_string().parse::<PlacementStrategy>().unwrap(), s);
        }
        assert!("depth-first".parse::<PlacementStrategy>().is_err());
    }
}
