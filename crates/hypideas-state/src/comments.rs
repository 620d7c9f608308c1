use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use hypideas_types::api::MAX_COMMENT_DEPTH;
use hypideas_types::models::Comment;

/// Default number of nested levels expanded when rendering a thread.
pub const DISPLAY_DEPTH: usize = MAX_COMMENT_DEPTH as usize;

/// A comment with its direct replies, in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    /// Number of comments below this node.
    pub fn descendant_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&CommentNode> = self.replies.iter().collect();
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.replies.iter());
        }
        count
    }

    pub fn find(&self, id: Uuid) -> Option<&CommentNode> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.comment.id == id {
                return Some(node);
            }
            stack.extend(node.replies.iter());
        }
        None
    }
}

/// Look up a comment anywhere in a forest.
pub fn find_in_forest(forest: &[CommentNode], id: Uuid) -> Option<&CommentNode> {
    forest.iter().find_map(|root| root.find(id))
}

/// Build the reply forest for a post from a flat, creation-ordered list.
///
/// Replies whose parent is not in the list are promoted to roots. Rows that
/// form a parent cycle are kept: the first cycle member reached from the
/// input order becomes a root. Construction never recurses, so long reply
/// chains are safe.
pub fn build_forest(comments: Vec<Comment>) -> Vec<CommentNode> {
    let mut slots: Vec<Option<Comment>> = Vec::with_capacity(comments.len());
    let mut index: HashMap<Uuid, usize> = HashMap::with_capacity(comments.len());
    for comment in comments {
        if index.contains_key(&comment.id) {
            debug!("Skipping duplicate comment row {}", comment.id);
            continue;
        }
        index.insert(comment.id, slots.len());
        slots.push(Some(comment));
    }

    let n = slots.len();
    let parent: Vec<Option<usize>> = slots
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            let comment = slot.as_ref()?;
            let parent_id = comment.parent_comment_id?;
            match index.get(&parent_id) {
                Some(&p) if p != i => Some(p),
                Some(_) => None,
                None => {
                    debug!(
                        "Comment {} references missing parent {}, promoting to root",
                        comment.id, parent_id
                    );
                    None
                }
            }
        })
        .collect();

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, p) in parent.iter().enumerate() {
        if let Some(p) = p {
            children[*p].push(i);
        }
    }

    // Pre-order walk from every root; `tree_children` only records the edge
    // through which a node was first reached.
    let mut visited = vec![false; n];
    let mut order: Vec<usize> = Vec::with_capacity(n);
    let mut tree_children: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut roots: Vec<usize> = Vec::new();

    let walk = |start: usize,
                    visited: &mut Vec<bool>,
                    order: &mut Vec<usize>,
                    tree_children: &mut Vec<Vec<usize>>| {
        let mut stack: Vec<(usize, Option<usize>)> = vec![(start, None)];
        while let Some((node, via)) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            order.push(node);
            if let Some(p) = via {
                tree_children[p].push(node);
            }
            for &child in children[node].iter().rev() {
                if !visited[child] {
                    stack.push((child, Some(node)));
                }
            }
        }
    };

    for i in 0..n {
        if parent[i].is_none() {
            roots.push(i);
            walk(i, &mut visited, &mut order, &mut tree_children);
        }
    }

    for i in 0..n {
        if visited[i] {
            continue;
        }
        let root = cycle_member(i, &parent);
        warn!(
            "Comment parent cycle detected, promoting {} to root",
            slots[root].as_ref().map(|c| c.id).unwrap_or_default()
        );
        roots.push(root);
        walk(root, &mut visited, &mut order, &mut tree_children);
    }

    // Children always follow their parent in pre-order, so building in
    // reverse completes every subtree before its parent needs it.
    let mut nodes: Vec<Option<CommentNode>> = vec![None; n];
    for &i in order.iter().rev() {
        let replies = tree_children[i]
            .iter()
            .filter_map(|&c| nodes[c].take())
            .collect();
        if let Some(comment) = slots[i].take() {
            nodes[i] = Some(CommentNode { comment, replies });
        }
    }

    roots.into_iter().filter_map(|r| nodes[r].take()).collect()
}

/// Follow parent links from `start` until a node repeats; that node lies on
/// the cycle.
fn cycle_member(start: usize, parent: &[Option<usize>]) -> usize {
    let mut seen = HashSet::new();
    let mut cur = start;
    while seen.insert(cur) {
        match parent[cur] {
            Some(p) => cur = p,
            None => return cur,
        }
    }
    cur
}

/// Fields of a parent comment needed to place a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ParentRef {
    pub id: Uuid,
    pub post_id: Uuid,
    #[serde(default)]
    pub depth: u8,
    #[serde(default)]
    pub thread_root_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub depth: u8,
    pub thread_root_id: Option<Uuid>,
}

/// Depth and thread root for a new comment replying to `parent`.
pub fn child_placement(parent: Option<&ParentRef>) -> Placement {
    match parent {
        None => Placement {
            depth: 0,
            thread_root_id: None,
        },
        Some(p) => Placement {
            depth: p.depth.saturating_add(1).min(MAX_COMMENT_DEPTH),
            thread_root_id: Some(p.thread_root_id.unwrap_or(p.id)),
        },
    }
}

/// One rendered line of a thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayComment<'a> {
    pub level: usize,
    pub comment: &'a Comment,
    /// Replies below this comment that are not expanded.
    pub hidden_replies: usize,
}

/// Pre-order listing of a forest, expanding at most `max_level` levels of
/// replies. Deeper comments stay in the data; their count is reported on
/// the last expanded ancestor.
pub fn flatten_for_display(forest: &[CommentNode], max_level: usize) -> Vec<DisplayComment<'_>> {
    let mut out = Vec::new();
    let mut stack: Vec<(&CommentNode, usize)> = forest.iter().rev().map(|n| (n, 0)).collect();
    while let Some((node, level)) = stack.pop() {
        if level >= max_level {
            out.push(DisplayComment {
                level,
                comment: &node.comment,
                hidden_replies: node.descendant_count(),
            });
            continue;
        }
        out.push(DisplayComment {
            level,
            comment: &node.comment,
            hidden_replies: 0,
        });
        for reply in node.replies.iter().rev() {
            stack.push((reply, level + 1));
        }
    }
    out
}
