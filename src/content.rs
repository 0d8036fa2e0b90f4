use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::reddit::{Comment, Item, SortOption, Timespan};

/// Which page the items belong to. Hot ranking only applies to subreddit
/// feeds; a single thread's comments are never time-filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageContext {
    Subreddit,
    User,
    Post,
}

const HOT_WINDOW_SECS: f64 = 86_400.0;
const HOT_JITTER_MAX: f64 = 0.1;

/// Client-side ordering of already-fetched items. Hot ordering carries a
/// small random jitter, so two calls over the same input may disagree
/// within that bound.
pub fn rank(items: Vec<Item>, sort: SortOption, timespan: Timespan, context: PageContext) -> Vec<Item> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    rank_at(items, sort, timespan, context, now, &mut rand::thread_rng())
}

/// Seam for tests: explicit clock and randomness.
pub fn rank_at<R: Rng>(
    mut items: Vec<Item>,
    sort: SortOption,
    timespan: Timespan,
    context: PageContext,
    now: f64,
    rng: &mut R,
) -> Vec<Item> {
    match sort {
        SortOption::New => {
            items.sort_by(|a, b| compare_f64_desc(a.created_utc(), b.created_utc()));
            items
        }
        SortOption::Top => {
            if context != PageContext::Post {
                if let Some(window) = timespan.window_secs() {
                    items.retain(|item| now - item.created_utc() <= window);
                }
            }
            items.sort_by(|a, b| b.score().or_zero().cmp(&a.score().or_zero()));
            items
        }
        SortOption::Hot => {
            if context != PageContext::Subreddit {
                return items;
            }
            let mut scored: Vec<(f64, Item)> = items
                .into_iter()
                .filter(|item| item.is_post() && now - item.created_utc() <= HOT_WINDOW_SECS)
                .map(|item| (hot_score(&item, now, rng), item))
                .collect();
            scored.sort_by(|a, b| compare_f64_desc(a.0, b.0));
            scored.into_iter().map(|(_, item)| item).collect()
        }
    }
}

/// Time-decayed popularity: raw score against `(age_hours + 2)^1.5`, with a
/// multiplicative jitter of at most 10% to break ties and keep the front
/// page from locking in.
fn hot_score<R: Rng>(item: &Item, now: f64, rng: &mut R) -> f64 {
    let age_hours = ((now - item.created_utc()).max(0.0)) / 3600.0;
    let base = item.score().or_zero() as f64 / (age_hours + 2.0).powf(1.5);
    base + rng.gen_range(0.0..HOT_JITTER_MAX) * base
}

fn compare_f64_desc(a: f64, b: f64) -> std::cmp::Ordering {
    b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
}

/// A comment with its ordered replies. Built per thread view, never stored.
#[derive(Debug, Clone)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

/// Reassembles a flat comment batch into a forest keyed on `parent_id`.
///
/// A comment roots when its parent is the post itself, itself (malformed
/// self-reference), or absent from the batch (replies to collapsed or
/// deleted ancestors stay visible instead of being dropped). Sibling order
/// follows input order. Assembly is iterative and marks placed nodes, so
/// depth is unbounded and malformed parent cycles cannot loop.
pub fn build_tree(comments: Vec<Comment>, root_id: &str) -> Vec<CommentNode> {
    if comments.is_empty() {
        return Vec::new();
    }

    let index: HashMap<String, usize> = comments
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.clone(), i))
        .collect();

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); comments.len()];
    let mut roots: Vec<usize> = Vec::new();
    for (i, comment) in comments.iter().enumerate() {
        let parent = bare_parent_id(&comment.parent_id);
        match index.get(parent) {
            Some(&p) if parent != root_id && parent != comment.id => children[p].push(i),
            _ => roots.push(i),
        }
    }

    // Pre-order walk; the visited marks make a revisit impossible.
    let mut order: Vec<usize> = Vec::with_capacity(comments.len());
    let mut visited = vec![false; comments.len()];
    let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
    while let Some(i) = stack.pop() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        order.push(i);
        for &child in children[i].iter().rev() {
            stack.push(child);
        }
    }

    // Attach children before parents by replaying the walk backwards.
    let mut built: Vec<Option<CommentNode>> = comments
        .into_iter()
        .map(|comment| {
            Some(CommentNode {
                comment,
                replies: Vec::new(),
            })
        })
        .collect();
    for &i in order.iter().rev() {
        let replies: Vec<CommentNode> = children[i]
            .iter()
            .filter_map(|&child| built[child].take())
            .collect();
        if let Some(node) = built[i].as_mut() {
            node.replies = replies;
        }
    }

    roots.into_iter().filter_map(|i| built[i].take()).collect()
}

/// `t1_abc` -> `abc`; ids without a prefix pass through untouched.
fn bare_parent_id(parent_id: &str) -> &str {
    match parent_id.split_once('_') {
        Some((_, id)) => id,
        None => parent_id,
    }
}
