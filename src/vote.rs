use std::sync::Arc;

use crate::data::InteractionService;
use crate::reddit::{Item, Score};
use crate::session;

#[derive(Debug, thiserror::Error)]
pub enum VoteError {
    #[error("voting is disabled on archived items")]
    Archived,
    #[error("login required to vote")]
    NoSession,
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Post,
    Comment,
}

impl ItemKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ItemKind::Post => "t3_",
            ItemKind::Comment => "t1_",
        }
    }
}

pub fn fullname(kind: ItemKind, id: &str) -> String {
    format!("{}{}", kind.prefix(), id)
}

/// Requesting the direction the item already has means "take it back"; the
/// remote call never carries a redundant same-direction vote.
pub fn effective_direction(likes: Option<bool>, requested: i32) -> i32 {
    match (likes, requested) {
        (Some(true), 1) | (Some(false), -1) => 0,
        _ => requested,
    }
}

/// Local score/like transition, applied only once the remote vote landed.
/// Hidden scores carry through unadjusted.
pub fn apply(score: Score, likes: Option<bool>, dir: i32) -> (Score, Option<bool>) {
    let next_likes = match dir {
        1 => Some(true),
        -1 => Some(false),
        _ => None,
    };
    let delta = match (likes, dir) {
        (Some(true), 0) => -1,
        (Some(false), 0) => 1,
        (Some(true), -1) => -2,
        (Some(false), 1) => 2,
        (Some(true), 1) | (Some(false), -1) => 0,
        (None, d) => d as i64,
        _ => 0,
    };
    let next_score = match score {
        Score::Known(value) => Score::Known(value + delta),
        Score::Hidden => Score::Hidden,
    };
    (next_score, next_likes)
}

/// The confirmed local patch for one item after a successful remote vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotePatch {
    pub fullname: String,
    pub score: Score,
    pub likes: Option<bool>,
}

/// Two-phase vote application: guards run locally, the remote call confirms,
/// and only then is the local patch handed back for commit. Nothing changes
/// when the remote call fails.
pub struct Coordinator {
    interactions: Arc<dyn InteractionService>,
    sessions: Arc<session::Manager>,
}

impl Coordinator {
    pub fn new(
        interactions: Arc<dyn InteractionService>,
        sessions: Arc<session::Manager>,
    ) -> Self {
        Self {
            interactions,
            sessions,
        }
    }

    pub fn vote(&self, item: &Item, requested: i32) -> Result<VotePatch, VoteError> {
        let (kind, id, score, likes, archived) = match item {
            Item::Post(post) => (
                ItemKind::Post,
                post.id.as_str(),
                post.score,
                post.likes,
                post.archived,
            ),
            Item::Comment(comment) => (
                ItemKind::Comment,
                comment.id.as_str(),
                comment.score,
                comment.likes,
                comment.archived,
            ),
        };

        if archived {
            return Err(VoteError::Archived);
        }
        if self.sessions.current().is_none() {
            return Err(VoteError::NoSession);
        }

        let dir = effective_direction(likes, requested);
        let name = fullname(kind, id);
        self.interactions.vote(&name, dir)?;

        let (next_score, next_likes) = apply(score, likes, dir);
        Ok(VotePatch {
            fullname: name,
            score: next_score,
            likes: next_likes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockInteractionService;
    use crate::reddit::Post;
    use crate::session::Manager;
    use crate::storage::{Options, Store, StoredSession};
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn post_item(score: i64, likes: Option<bool>, archived: bool) -> Item {
        Item::Post(Post {
            id: "abc".into(),
            name: "t3_abc".into(),
            title: "title".into(),
            subreddit: "rust".into(),
            author: "someone".into(),
            url: String::new(),
            permalink: String::new(),
            thumbnail: String::new(),
            score: Score::Known(score),
            likes,
            archived,
            num_comments: 0,
            created_utc: 0.0,
        })
    }

    fn logged_in_manager(dir: &tempfile::TempDir) -> Arc<Manager> {
        let store = Arc::new(
            Store::open(Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        );
        store
            .save_session(&StoredSession {
                access_token: "access".into(),
                refresh_token: None,
                expires_at: Utc::now() + Duration::hours(1),
            })
            .unwrap();
        let flow = Arc::new(
            crate::auth::Flow::new(store.clone(), crate::auth::Config::default()).unwrap(),
        );
        let manager = Arc::new(Manager::new(store, flow));
        manager.rehydrate().unwrap();
        manager
    }

    fn logged_out_manager(dir: &tempfile::TempDir) -> Arc<Manager> {
        let store = Arc::new(
            Store::open(Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        );
        let flow = Arc::new(
            crate::auth::Flow::new(store.clone(), crate::auth::Config::default()).unwrap(),
        );
        let manager = Arc::new(Manager::new(store, flow));
        manager.rehydrate().unwrap();
        manager
    }

    #[test]
    fn same_direction_becomes_unvote() {
        assert_eq!(effective_direction(Some(true), 1), 0);
        assert_eq!(effective_direction(Some(false), -1), 0);
        assert_eq!(effective_direction(Some(true), -1), -1);
        assert_eq!(effective_direction(None, 1), 1);
        assert_eq!(effective_direction(None, 0), 0);
    }

    #[test]
    fn transition_table() {
        assert_eq!(apply(Score::Known(10), Some(true), 0), (Score::Known(9), None));
        assert_eq!(apply(Score::Known(10), Some(false), 0), (Score::Known(11), None));
        assert_eq!(
            apply(Score::Known(10), Some(true), -1),
            (Score::Known(8), Some(false))
        );
        assert_eq!(
            apply(Score::Known(10), Some(false), 1),
            (Score::Known(12), Some(true))
        );
        assert_eq!(apply(Score::Known(10), None, 1), (Score::Known(11), Some(true)));
        assert_eq!(apply(Score::Known(10), None, -1), (Score::Known(9), Some(false)));
    }

    #[test]
    fn hidden_score_is_never_adjusted() {
        assert_eq!(apply(Score::Hidden, Some(true), -1), (Score::Hidden, Some(false)));
        assert_eq!(apply(Score::Hidden, None, 1), (Score::Hidden, Some(true)));
    }

    #[test]
    fn upvoted_item_downvote_lands_at_minus_two() {
        // Flipping an upvote straight to a downvote swings the score by two.
        let dir = tempdir().unwrap();
        let interactions = Arc::new(MockInteractionService::default());
        let coordinator = Coordinator::new(interactions.clone(), logged_in_manager(&dir));

        let item = post_item(10, Some(true), false);
        let patch = coordinator.vote(&item, -1).unwrap();

        assert_eq!(interactions.votes(), vec![("t3_abc".to_string(), -1)]);
        assert_eq!(patch.score, Score::Known(8));
        assert_eq!(patch.likes, Some(false));
    }

    #[test]
    fn archived_item_is_rejected_without_network() {
        let dir = tempdir().unwrap();
        let interactions = Arc::new(MockInteractionService::default());
        let coordinator = Coordinator::new(interactions.clone(), logged_in_manager(&dir));

        let item = post_item(10, None, true);
        assert!(matches!(coordinator.vote(&item, 1), Err(VoteError::Archived)));
        assert!(interactions.votes().is_empty());
    }

    #[test]
    fn logged_out_vote_is_rejected_without_network() {
        let dir = tempdir().unwrap();
        let interactions = Arc::new(MockInteractionService::default());
        let coordinator = Coordinator::new(interactions.clone(), logged_out_manager(&dir));

        let item = post_item(10, None, false);
        assert!(matches!(coordinator.vote(&item, 1), Err(VoteError::NoSession)));
        assert!(interactions.votes().is_empty());
    }

    #[test]
    fn failed_remote_vote_commits_nothing() {
        let dir = tempdir().unwrap();
        let interactions = Arc::new(MockInteractionService::failing());
        let coordinator = Coordinator::new(interactions, logged_in_manager(&dir));

        let item = post_item(10, None, false);
        assert!(matches!(coordinator.vote(&item, 1), Err(VoteError::Remote(_))));
    }
}
