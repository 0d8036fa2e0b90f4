use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://oauth.reddit.com/";

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<OAuthToken>;
}

#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub expires_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Default)]
pub struct ListingOptions {
    pub after: Option<String>,
    pub limit: Option<u32>,
}

impl ListingOptions {
    fn into_params(self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(after) = self.after {
            params.push(("after".into(), after));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SortOption {
    Hot,
    New,
    Top,
}

impl Default for SortOption {
    fn default() -> Self {
        SortOption::Hot
    }
}

impl SortOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOption::Hot => "hot",
            SortOption::New => "new",
            SortOption::Top => "top",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Timespan {
    Day,
    Month,
    Year,
    All,
}

impl Default for Timespan {
    fn default() -> Self {
        Timespan::All
    }
}

impl Timespan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timespan::Day => "day",
            Timespan::Month => "month",
            Timespan::Year => "year",
            Timespan::All => "all",
        }
    }

    /// Window width in seconds; `None` means unbounded.
    pub fn window_secs(&self) -> Option<f64> {
        match self {
            Timespan::Day => Some(86_400.0),
            Timespan::Month => Some(2_592_000.0),
            Timespan::Year => Some(31_536_000.0),
            Timespan::All => None,
        }
    }
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    rate: RwLock<RateLimit>,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    pub used: f64,
    pub remaining: f64,
    pub reset_at: Option<SystemTime>,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("reddit client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            token_provider,
            http,
            user_agent: config.user_agent,
            base_url,
            rate: RwLock::new(RateLimit::default()),
        })
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate.read().unwrap().clone()
    }

    /// Posts for a subreddit (or the front page when `subreddit` is empty),
    /// decoded into the tagged item union at this boundary.
    pub fn subreddit_listing(
        &self,
        subreddit: &str,
        sort: SortOption,
        timespan: Timespan,
        opts: ListingOptions,
    ) -> Result<Vec<Item>> {
        let path = if subreddit.is_empty() {
            format!("/{}.json", sort.as_str())
        } else {
            format!(
                "/r/{}/{}.json",
                subreddit.trim_start_matches("r/"),
                sort.as_str()
            )
        };
        let mut params = opts.into_params();
        if sort == SortOption::Top {
            params.push(("t".into(), timespan.as_str().into()));
        }
        let resp = self.request(Method::GET, &path, &params, None)?;
        let envelope: ListingEnvelope = resp.json().context("reddit: decode listing")?;
        items_from_children(envelope.data.children)
    }

    /// One thread: the post plus its comments flattened to a pre-order list
    /// that keeps `parent_id` linkage for the tree builder.
    pub fn post_comments(&self, subreddit: &str, article: &str) -> Result<(Post, Vec<Comment>)> {
        let base = subreddit.trim_start_matches("r/");
        let path = if base.is_empty() {
            format!("/comments/{}.json", article)
        } else {
            format!("/r/{}/comments/{}.json", base, article)
        };
        let resp = self.request(Method::GET, &path, &[], None)?;
        let payload: Vec<Value> = resp.json()?;
        if payload.len() < 2 {
            bail!("reddit: comments payload missing elements");
        }
        let post_listing: ListingEnvelope =
            serde_json::from_value(payload[0].clone()).context("reddit: decode post listing")?;
        let comment_listing: ListingEnvelope = serde_json::from_value(payload[1].clone())
            .context("reddit: decode comment listing")?;

        let post = post_listing
            .data
            .children
            .into_iter()
            .find(|thing| thing.kind == "t3")
            .map(|thing| serde_json::from_value::<Post>(thing.data))
            .transpose()
            .context("reddit: decode post")?
            .ok_or_else(|| anyhow!("reddit: post listing empty"))?;

        let roots = raw_comments_from_children(comment_listing.data.children)?;
        Ok((post, flatten_comments(roots)))
    }

    /// Identity of the account behind the current token.
    pub fn me(&self) -> Result<Profile> {
        let resp = self.request(Method::GET, "/api/v1/me", &[], None)?;
        resp.json().context("reddit: decode profile")
    }

    pub fn user_submitted(&self, username: &str, opts: ListingOptions) -> Result<Vec<Item>> {
        self.user_listing(username, "submitted", opts)
    }

    pub fn user_comments(&self, username: &str, opts: ListingOptions) -> Result<Vec<Item>> {
        self.user_listing(username, "comments", opts)
    }

    fn user_listing(&self, username: &str, kind: &str, opts: ListingOptions) -> Result<Vec<Item>> {
        if username.trim().is_empty() {
            bail!("reddit: username is required");
        }
        let path = format!("/user/{}/{}.json", username.trim_start_matches("u/"), kind);
        let params = opts.into_params();
        let resp = self.request(Method::GET, &path, &params, None)?;
        let envelope: ListingEnvelope = resp.json().context("reddit: decode user listing")?;
        items_from_children(envelope.data.children)
    }

    pub fn vote(&self, fullname: &str, dir: i32) -> Result<()> {
        if !(-1..=1).contains(&dir) {
            bail!("reddit: vote direction must be -1, 0, or 1");
        }
        let form = vec![
            ("id".to_string(), fullname.to_string()),
            ("dir".to_string(), dir.to_string()),
        ];
        self.request(Method::POST, "/api/vote", &[], Some(form))?;
        Ok(())
    }

    pub fn reply(&self, parent: &str, text: &str) -> Result<Comment> {
        if parent.trim().is_empty() {
            bail!("reddit: reply parent is required");
        }
        if text.trim().is_empty() {
            bail!("reddit: reply text is required");
        }
        let form = vec![
            ("parent".to_string(), parent.to_string()),
            ("text".to_string(), text.to_string()),
            ("api_type".to_string(), "json".to_string()),
        ];
        let resp = self.request(Method::POST, "/api/comment", &[], Some(form))?;
        let payload: CommentResponse = resp.json()?;
        if let Some(err) = payload.json.errors.first() {
            let joined = err
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            bail!("reddit: comment error: {}", joined);
        }
        let raw = payload
            .json
            .data
            .things
            .into_iter()
            .next()
            .map(|thing| thing.data)
            .ok_or_else(|| anyhow!("reddit: comment response empty"))?;
        Ok(raw.into_comment())
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        form: Option<Vec<(String, String)>>,
    ) -> Result<Response> {
        let token = self.token_provider.token()?;
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        let mut req = self.http.request(method, url);
        let auth_value = format!("Bearer {}", token.access_token);
        req = req.header(USER_AGENT, self.user_agent.clone());
        req = req.header(AUTHORIZATION, auth_value);
        if let Some(form_data) = form {
            req = req.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
            req = req.form(&form_data);
        }

        let resp = req.send()?;
        self.capture_rate(resp.headers());
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            match status.as_u16() {
                401 => Err(anyhow!("reddit: unauthorized")),
                403 => Err(anyhow!("reddit: forbidden")),
                429 => Err(anyhow!("reddit: rate limited: {}", body)),
                _ => Err(anyhow!("reddit: api error {}: {}", status, body)),
            }
        }
    }

    fn capture_rate(&self, headers: &HeaderMap) {
        let remaining = header_float(headers, "x-ratelimit-remaining");
        let used = header_float(headers, "x-ratelimit-used");
        let reset = header_float(headers, "x-ratelimit-reset");
        if remaining == 0.0 && used == 0.0 && reset == 0.0 {
            return;
        }
        let reset_at = SystemTime::now().checked_add(Duration::from_secs_f64(reset.max(0.0)));
        let mut rate = self.rate.write().unwrap();
        rate.remaining = remaining;
        rate.used = used;
        rate.reset_at = reset_at;
    }
}

fn header_float(headers: &HeaderMap, key: &str) -> f64 {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// A score is hidden on fresh comments; a hidden score is never shown or
/// adjusted, only carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Known(i64),
    Hidden,
}

impl Score {
    pub fn from_parts(score: i64, hidden: bool) -> Self {
        if hidden {
            Score::Hidden
        } else {
            Score::Known(score)
        }
    }

    pub fn or_zero(&self) -> i64 {
        match self {
            Score::Known(value) => *value,
            Score::Hidden => 0,
        }
    }
}

impl Default for Score {
    fn default() -> Self {
        Score::Known(0)
    }
}

#[derive(Debug, Clone)]
pub struct Post {
    pub id: String,
    pub name: String,
    pub title: String,
    pub subreddit: String,
    pub author: String,
    pub url: String,
    pub permalink: String,
    pub thumbnail: String,
    pub score: Score,
    pub likes: Option<bool>,
    pub archived: bool,
    pub num_comments: i64,
    pub created_utc: f64,
}

impl Post {
    pub fn created_at(&self) -> Option<SystemTime> {
        created_at(self.created_utc)
    }
}

impl<'de> Deserialize<'de> for Post {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct PostHelper {
            id: String,
            name: String,
            title: String,
            #[serde(default)]
            subreddit: String,
            #[serde(default)]
            author: String,
            #[serde(default)]
            url: String,
            #[serde(default)]
            permalink: String,
            #[serde(default)]
            thumbnail: String,
            #[serde(default)]
            score: i64,
            #[serde(default)]
            hide_score: bool,
            #[serde(default)]
            likes: Option<bool>,
            #[serde(default)]
            archived: bool,
            #[serde(default)]
            num_comments: i64,
            #[serde(default)]
            created_utc: f64,
        }

        let helper = PostHelper::deserialize(deserializer)?;
        Ok(Post {
            id: helper.id,
            name: helper.name,
            title: helper.title,
            subreddit: helper.subreddit,
            author: helper.author,
            url: helper.url,
            permalink: helper.permalink,
            thumbnail: helper.thumbnail,
            score: Score::from_parts(helper.score, helper.hide_score),
            likes: helper.likes,
            archived: helper.archived,
            num_comments: helper.num_comments,
            created_utc: helper.created_utc,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub id: String,
    pub name: String,
    pub body: String,
    pub author: String,
    pub parent_id: String,
    pub permalink: String,
    pub score: Score,
    pub likes: Option<bool>,
    pub archived: bool,
    pub created_utc: f64,
}

impl Comment {
    pub fn created_at(&self) -> Option<SystemTime> {
        created_at(self.created_utc)
    }
}

fn created_at(created_utc: f64) -> Option<SystemTime> {
    if created_utc == 0.0 {
        return None;
    }
    let secs = created_utc.trunc() as u64;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}

/// One element of any listing: either a post (`t3`) or a comment (`t1`).
/// Built once at the decode boundary; other kinds never cross it.
#[derive(Debug, Clone)]
pub enum Item {
    Post(Post),
    Comment(Comment),
}

impl Item {
    pub fn id(&self) -> &str {
        match self {
            Item::Post(post) => &post.id,
            Item::Comment(comment) => &comment.id,
        }
    }

    pub fn created_utc(&self) -> f64 {
        match self {
            Item::Post(post) => post.created_utc,
            Item::Comment(comment) => comment.created_utc,
        }
    }

    pub fn score(&self) -> Score {
        match self {
            Item::Post(post) => post.score,
            Item::Comment(comment) => comment.score,
        }
    }

    pub fn is_post(&self) -> bool {
        matches!(self, Item::Post(_))
    }
}

/// Read-only snapshot of the signed-in account.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub link_karma: i64,
    #[serde(default)]
    pub comment_karma: i64,
}

impl Profile {
    pub fn created_at(&self) -> Option<SystemTime> {
        created_at(self.created_utc)
    }

    pub fn account_age(&self, now: SystemTime) -> Option<Duration> {
        self.created_at()
            .and_then(|created| now.duration_since(created).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ListingEnvelope {
    #[allow(dead_code)]
    kind: String,
    data: ListingData,
}

#[derive(Debug, Clone, Deserialize)]
struct ListingData {
    #[serde(default)]
    #[allow(dead_code)]
    after: Option<String>,
    children: Vec<RawThing>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawThing {
    kind: String,
    data: Value,
}

fn items_from_children(children: Vec<RawThing>) -> Result<Vec<Item>> {
    let mut items = Vec::with_capacity(children.len());
    for thing in children {
        match thing.kind.as_str() {
            "t3" => {
                let post: Post =
                    serde_json::from_value(thing.data).context("reddit: decode post item")?;
                items.push(Item::Post(post));
            }
            "t1" => {
                let raw: RawComment =
                    serde_json::from_value(thing.data).context("reddit: decode comment item")?;
                items.push(Item::Comment(raw.into_comment()));
            }
            // "more" placeholders and anything unrecognized stop here.
            _ => {}
        }
    }
    Ok(items)
}

fn raw_comments_from_children(children: Vec<RawThing>) -> Result<Vec<RawComment>> {
    let mut comments = Vec::with_capacity(children.len());
    for thing in children {
        if thing.kind != "t1" {
            continue;
        }
        let raw: RawComment =
            serde_json::from_value(thing.data).context("reddit: decode comment")?;
        comments.push(raw);
    }
    Ok(comments)
}

/// Pre-order walk over nested reply listings, iterative so thread depth is
/// unbounded.
fn flatten_comments(roots: Vec<RawComment>) -> Vec<Comment> {
    let mut flat = Vec::new();
    let mut stack: Vec<RawComment> = roots.into_iter().rev().collect();
    while let Some(mut raw) = stack.pop() {
        let replies = raw.replies.take();
        flat.push(raw.into_comment());
        if let Some(listing) = replies {
            if let Ok(children) = raw_comments_from_children(listing.data.children) {
                for child in children.into_iter().rev() {
                    stack.push(child);
                }
            }
        }
    }
    flat
}

#[derive(Debug, Clone)]
struct RawComment {
    id: String,
    name: String,
    body: String,
    author: String,
    parent_id: String,
    permalink: String,
    score: Score,
    likes: Option<bool>,
    archived: bool,
    created_utc: f64,
    replies: Option<Box<ListingEnvelope>>,
}

impl RawComment {
    fn into_comment(self) -> Comment {
        Comment {
            id: self.id,
            name: self.name,
            body: self.body,
            author: self.author,
            parent_id: self.parent_id,
            permalink: self.permalink,
            score: self.score,
            likes: self.likes,
            archived: self.archived,
            created_utc: self.created_utc,
        }
    }
}

impl<'de> Deserialize<'de> for RawComment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CommentHelper {
            id: String,
            name: String,
            #[serde(default)]
            body: String,
            #[serde(default)]
            author: String,
            #[serde(default)]
            parent_id: String,
            #[serde(default)]
            permalink: String,
            #[serde(default)]
            score: i64,
            #[serde(default)]
            score_hidden: bool,
            #[serde(default)]
            likes: Option<bool>,
            #[serde(default)]
            archived: bool,
            #[serde(default)]
            created_utc: f64,
            #[serde(default)]
            replies: Value,
        }

        let helper = CommentHelper::deserialize(deserializer)?;
        // Reddit sends "" instead of null when a comment has no replies.
        let replies = if helper.replies.is_null() || helper.replies == "" {
            None
        } else {
            serde_json::from_value::<ListingEnvelope>(helper.replies)
                .ok()
                .map(Box::new)
        };
        Ok(RawComment {
            id: helper.id,
            name: helper.name,
            body: helper.body,
            author: helper.author,
            parent_id: helper.parent_id,
            permalink: helper.permalink,
            score: Score::from_parts(helper.score, helper.score_hidden),
            likes: helper.likes,
            archived: helper.archived,
            created_utc: helper.created_utc,
            replies,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CommentResponse {
    json: CommentResponseBody,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentResponseBody {
    errors: Vec<Vec<serde_json::Value>>,
    data: CommentResponseData,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentResponseData {
    things: Vec<RawCommentThing>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCommentThing {
    #[allow(dead_code)]
    kind: String,
    data: RawComment,
}
