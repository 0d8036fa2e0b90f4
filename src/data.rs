use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;

use crate::reddit::{self, Comment, Item, ListingOptions, Post, Profile, SortOption, Timespan};

pub trait FeedService: Send + Sync {
    fn load_subreddit(
        &self,
        name: &str,
        sort: SortOption,
        timespan: Timespan,
    ) -> Result<Vec<Item>>;
}

pub trait ThreadService: Send + Sync {
    fn load_thread(&self, subreddit: &str, article: &str) -> Result<(Post, Vec<Comment>)>;
}

pub trait ActivityService: Send + Sync {
    /// A user's submitted posts and comments, combined into one batch for
    /// ranking.
    fn load_overview(&self, username: &str) -> Result<Vec<Item>>;
}

pub trait ProfileService: Send + Sync {
    /// Identity of the signed-in account, as the API reports it.
    fn load_profile(&self) -> Result<Profile>;
}

pub trait InteractionService: Send + Sync {
    fn vote(&self, fullname: &str, dir: i32) -> Result<()>;
    fn reply(&self, parent: &str, text: &str) -> Result<Comment>;
}

pub struct RedditFeedService {
    client: Arc<reddit::Client>,
}

impl RedditFeedService {
    pub fn new(client: Arc<reddit::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for RedditFeedService {
    fn load_subreddit(
        &self,
        name: &str,
        sort: SortOption,
        timespan: Timespan,
    ) -> Result<Vec<Item>> {
        self.client
            .subreddit_listing(name, sort, timespan, ListingOptions::default())
            .context("fetch subreddit feed")
    }
}

pub struct RedditThreadService {
    client: Arc<reddit::Client>,
}

impl RedditThreadService {
    pub fn new(client: Arc<reddit::Client>) -> Self {
        Self { client }
    }
}

impl ThreadService for RedditThreadService {
    fn load_thread(&self, subreddit: &str, article: &str) -> Result<(Post, Vec<Comment>)> {
        self.client
            .post_comments(subreddit, article)
            .context("fetch thread")
    }
}

pub struct RedditActivityService {
    client: Arc<reddit::Client>,
}

impl RedditActivityService {
    pub fn new(client: Arc<reddit::Client>) -> Self {
        Self { client }
    }
}

impl ActivityService for RedditActivityService {
    /// Submitted posts and comments are independent fetches; they run on two
    /// scoped threads and are joined before the combined batch is returned.
    fn load_overview(&self, username: &str) -> Result<Vec<Item>> {
        let (posts, comments) = thread::scope(|scope| {
            let posts = scope.spawn(|| {
                self.client
                    .user_submitted(username, ListingOptions::default())
            });
            let comments = scope.spawn(|| {
                self.client
                    .user_comments(username, ListingOptions::default())
            });
            (
                posts
                    .join()
                    .map_err(|_| anyhow!("user submitted fetch panicked")),
                comments
                    .join()
                    .map_err(|_| anyhow!("user comments fetch panicked")),
            )
        });
        let mut items = posts?.context("fetch user submitted")?;
        items.extend(comments?.context("fetch user comments")?);
        Ok(items)
    }
}

pub struct RedditProfileService {
    client: Arc<reddit::Client>,
}

impl RedditProfileService {
    pub fn new(client: Arc<reddit::Client>) -> Self {
        Self { client }
    }
}

impl ProfileService for RedditProfileService {
    fn load_profile(&self) -> Result<Profile> {
        self.client.me().context("fetch profile")
    }
}

pub struct RedditInteractionService {
    client: Arc<reddit::Client>,
}

impl RedditInteractionService {
    pub fn new(client: Arc<reddit::Client>) -> Self {
        Self { client }
    }
}

impl InteractionService for RedditInteractionService {
    fn vote(&self, fullname: &str, dir: i32) -> Result<()> {
        self.client.vote(fullname, dir)
    }

    fn reply(&self, parent: &str, text: &str) -> Result<Comment> {
        self.client.reply(parent, text)
    }
}

/// In-memory stand-in that records calls; test double for the coordinator
/// and for offline runs.
#[derive(Default)]
pub struct MockInteractionService {
    votes: Mutex<Vec<(String, i32)>>,
    fail: bool,
}

impl MockInteractionService {
    pub fn failing() -> Self {
        Self {
            votes: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn votes(&self) -> Vec<(String, i32)> {
        self.votes.lock().clone()
    }
}

impl InteractionService for MockInteractionService {
    fn vote(&self, fullname: &str, dir: i32) -> Result<()> {
        if self.fail {
            anyhow::bail!("mock vote failure");
        }
        self.votes.lock().push((fullname.to_string(), dir));
        Ok(())
    }

    fn reply(&self, parent: &str, text: &str) -> Result<Comment> {
        if self.fail {
            anyhow::bail!("mock reply failure");
        }
        Ok(Comment {
            id: "mock".into(),
            name: "t1_mock".into(),
            body: text.into(),
            author: "orangered".into(),
            parent_id: parent.into(),
            permalink: String::new(),
            score: reddit::Score::Known(1),
            likes: None,
            archived: false,
            created_utc: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reddit::{Client, ClientConfig, OAuthToken, TokenProvider};
    use tiny_http::{Header, Response, Server};

    struct StaticToken;

    impl TokenProvider for StaticToken {
        fn token(&self) -> Result<OAuthToken> {
            Ok(OAuthToken {
                access_token: "access".into(),
                expires_at: None,
            })
        }
    }

    fn stub_api(body: &'static str) -> String {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}/", server.server_addr());
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let response = Response::from_string(body).with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                );
                let _ = request.respond(response);
            }
        });
        base
    }

    fn api_client(base: String) -> Arc<Client> {
        Arc::new(
            Client::new(
                Arc::new(StaticToken),
                ClientConfig {
                    user_agent: "orangered-test/0.1".into(),
                    base_url: Some(base),
                    http_client: None,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn profile_service_loads_identity() {
        let base = stub_api(
            r#"{"id":"u1","name":"tester","created_utc":1500000000.0,"link_karma":10,"comment_karma":5}"#,
        );
        let service = RedditProfileService::new(api_client(base));
        let profile = service.load_profile().unwrap();
        assert_eq!(profile.name, "tester");
        assert_eq!(profile.link_karma, 10);
        assert_eq!(profile.comment_karma, 5);
    }
}
