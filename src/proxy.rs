use std::io::Read;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crossbeam_channel::{bounded, Sender};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{info, warn};
use url::Url;

/// The confidential half of the OAuth dance. The client secret lives here
/// and only here; browsers and CLI sessions exchange codes through this
/// process instead of talking to the token endpoint themselves.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub allowed_origin: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
    pub redirect_uri: String,
    pub token_url: String,
    pub upstream_base: String,
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3001".into(),
            allowed_origin: "http://localhost:3000".into(),
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: "orangered-proxy/0.1".into(),
            redirect_uri: "http://127.0.0.1:3000/callback".into(),
            token_url: "https://www.reddit.com/api/v1/access_token".into(),
            upstream_base: "https://oauth.reddit.com".into(),
            http_timeout: Duration::from_secs(20),
        }
    }
}

pub struct Proxy {
    cfg: Config,
    server: Server,
    http: HttpClient,
}

pub struct Handle {
    shutdown: Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl Handle {
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.thread.join();
    }

    pub fn join(self) {
        let _ = self.thread.join();
    }
}

impl Proxy {
    pub fn bind(cfg: Config) -> Result<Self> {
        if cfg.client_id.trim().is_empty() || cfg.client_secret.trim().is_empty() {
            anyhow::bail!("proxy: client id and secret are required");
        }
        let server =
            Server::http(&cfg.listen).map_err(|err| anyhow!("proxy: listen: {}", err))?;
        let http = HttpClient::builder()
            .timeout(cfg.http_timeout)
            .build()
            .context("proxy: build http client")?;
        Ok(Self { cfg, server, http })
    }

    pub fn addr(&self) -> String {
        self.server.server_addr().to_string()
    }

    /// Serves until `Handle::stop`. Requests are handled in turn on one
    /// worker thread; the loop polls so shutdown is never missed.
    pub fn start(self) -> Handle {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let thread = thread::spawn(move || {
            info!(addr = %self.addr(), "proxy listening");
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                match self.server.recv_timeout(Duration::from_millis(200)) {
                    Ok(Some(request)) => self.handle(request),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "proxy accept failed");
                        break;
                    }
                }
            }
        });
        Handle {
            shutdown: shutdown_tx,
            thread,
        }
    }

    fn handle(&self, mut request: Request) {
        let method = request.method().clone();
        let raw_url = request.url().to_string();

        let reply = if method == Method::Options {
            self.preflight()
        } else {
            match (method.clone(), route_path(&raw_url)) {
                (Method::Post, "/api/token") => self.exchange_token(&mut request),
                (Method::Post, "/api/refresh_token") => self.refresh_token(&mut request),
                (Method::Get, "/api/me") => self.forward_me(&request),
                (Method::Get, "/api/posts") => self.forward_posts(&request, &raw_url),
                _ => Reply::json(404, r#"{"error":"not found"}"#.into()),
            }
        };

        info!(method = %method, url = %raw_url, status = reply.status, "proxy request");
        let _ = request.respond(reply.into_response(&self.cfg.allowed_origin));
    }

    fn preflight(&self) -> Reply {
        Reply {
            status: 204,
            body: String::new(),
            headers: vec![
                ("Access-Control-Allow-Methods", "GET, POST, OPTIONS".into()),
                ("Access-Control-Allow-Headers", "Authorization, Content-Type".into()),
            ],
        }
    }

    fn exchange_token(&self, request: &mut Request) -> Reply {
        #[derive(Deserialize)]
        struct TokenBody {
            #[serde(default)]
            code: String,
        }
        let body: TokenBody = match read_json(request) {
            Ok(body) => body,
            Err(reply) => return reply,
        };
        if body.code.is_empty() {
            return Reply::json(400, r#"{"error":"missing authorization code"}"#.into());
        }
        self.forward_grant(&[
            ("grant_type", "authorization_code"),
            ("code", &body.code),
            ("redirect_uri", &self.cfg.redirect_uri),
        ])
    }

    fn refresh_token(&self, request: &mut Request) -> Reply {
        #[derive(Deserialize)]
        struct RefreshBody {
            #[serde(default)]
            refresh_token: String,
        }
        let body: RefreshBody = match read_json(request) {
            Ok(body) => body,
            Err(reply) => return reply,
        };
        if body.refresh_token.is_empty() {
            return Reply::json(400, r#"{"error":"missing refresh token"}"#.into());
        }
        self.forward_grant(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", &body.refresh_token),
        ])
    }

    /// Performs the confidential POST against the token endpoint with HTTP
    /// Basic client credentials, relaying upstream status and body verbatim.
    fn forward_grant(&self, form: &[(&str, &str)]) -> Reply {
        let credentials =
            STANDARD.encode(format!("{}:{}", self.cfg.client_id, self.cfg.client_secret));
        let result = self
            .http
            .post(&self.cfg.token_url)
            .header(AUTHORIZATION, format!("Basic {}", credentials))
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .form(form)
            .send();
        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().unwrap_or_default();
                if status >= 400 {
                    warn!(status, "token endpoint rejected grant");
                }
                Reply::json(status, body)
            }
            Err(err) => {
                warn!(error = %err, "token endpoint unreachable");
                Reply::json(502, r#"{"error":"token endpoint unreachable"}"#.into())
            }
        }
    }

    fn forward_me(&self, request: &Request) -> Reply {
        let bearer = match bearer_header(request) {
            Some(bearer) => bearer,
            None => return Reply::json(401, r#"{"error":"missing bearer token"}"#.into()),
        };
        self.forward_get(&format!("{}/api/v1/me", self.cfg.upstream_base), &bearer)
    }

    fn forward_posts(&self, request: &Request, raw_url: &str) -> Reply {
        let bearer = match bearer_header(request) {
            Some(bearer) => bearer,
            None => return Reply::json(401, r#"{"error":"missing bearer token"}"#.into()),
        };
        let url = match Url::parse(&format!("http://localhost{}", raw_url)) {
            Ok(url) => url,
            Err(_) => return Reply::json(400, r#"{"error":"bad request"}"#.into()),
        };
        let mut subreddit = String::new();
        let mut sort = "hot".to_string();
        let mut timespan = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "subreddit" => subreddit = value.into_owned(),
                "sort" => sort = value.into_owned(),
                "t" => timespan = Some(value.into_owned()),
                _ => {}
            }
        }
        let mut upstream = if subreddit.is_empty() {
            format!("{}/{}.json", self.cfg.upstream_base, sort)
        } else {
            format!("{}/r/{}/{}.json", self.cfg.upstream_base, subreddit, sort)
        };
        if let Some(t) = timespan {
            upstream.push_str(&format!("?t={}", t));
        }
        self.forward_get(&upstream, &bearer)
    }

    fn forward_get(&self, upstream: &str, bearer: &str) -> Reply {
        let result = self
            .http
            .get(upstream)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .header("Authorization", bearer)
            .send();
        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().unwrap_or_default();
                Reply::json(status, body)
            }
            Err(err) => {
                warn!(error = %err, upstream, "upstream unreachable");
                Reply::json(502, r#"{"error":"upstream unreachable"}"#.into())
            }
        }
    }
}

struct Reply {
    status: u16,
    body: String,
    headers: Vec<(&'static str, String)>,
}

impl Reply {
    fn json(status: u16, body: String) -> Self {
        Self {
            status,
            body,
            headers: vec![("Content-Type", "application/json".into())],
        }
    }

    fn into_response(self, allowed_origin: &str) -> Response<std::io::Cursor<Vec<u8>>> {
        let mut response = Response::from_string(self.body).with_status_code(self.status);
        for (name, value) in self.headers {
            if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
                response = response.with_header(header);
            }
        }
        if let Ok(header) =
            Header::from_bytes(&b"Access-Control-Allow-Origin"[..], allowed_origin.as_bytes())
        {
            response = response.with_header(header);
        }
        response
    }
}

fn route_path(raw_url: &str) -> &str {
    raw_url.split('?').next().unwrap_or(raw_url)
}

fn bearer_header(request: &Request) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv("Authorization"))
        .map(|header| header.value.as_str().to_string())
        .filter(|value| !value.is_empty())
}

fn read_json<T: serde::de::DeserializeOwned>(request: &mut Request) -> Result<T, Reply> {
    let mut body = String::new();
    if request.as_reader().read_to_string(&mut body).is_err() {
        return Err(Reply::json(400, r#"{"error":"unreadable body"}"#.into()));
    }
    serde_json::from_str(&body)
        .map_err(|_| Reply::json(400, r#"{"error":"malformed json body"}"#.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct SeenRequest {
        authorization: Option<String>,
        body: String,
    }

    /// Stub token endpoint that records what the proxy forwarded.
    fn stub_upstream(status: u16, reply_body: &'static str) -> (String, Arc<Mutex<Vec<SeenRequest>>>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/v1/access_token", server.server_addr());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let authorization = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string());
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                record.lock().push(SeenRequest {
                    authorization,
                    body,
                });
                let _ = request
                    .respond(Response::from_string(reply_body).with_status_code(status));
            }
        });
        (url, seen)
    }

    fn start_proxy(token_url: String) -> (String, Handle) {
        let proxy = Proxy::bind(Config {
            listen: "127.0.0.1:0".into(),
            client_id: "cid".into(),
            client_secret: "secret".into(),
            token_url,
            ..Config::default()
        })
        .unwrap();
        let base = format!("http://{}", proxy.addr());
        (base, proxy.start())
    }

    #[test]
    fn token_route_forwards_basic_auth_and_grant() {
        let (token_url, seen) = stub_upstream(200, r#"{"access_token":"A","expires_in":3600}"#);
        let (base, handle) = start_proxy(token_url);

        let client = HttpClient::new();
        let resp = client
            .post(format!("{}/api/token", base))
            .json(&serde_json::json!({ "code": "abc" }))
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(resp.text().unwrap().contains("access_token"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        // base64("cid:secret")
        assert_eq!(
            seen[0].authorization.as_deref(),
            Some("Basic Y2lkOnNlY3JldA==")
        );
        assert!(seen[0].body.contains("grant_type=authorization_code"));
        assert!(seen[0].body.contains("code=abc"));

        handle.stop();
    }

    #[test]
    fn refresh_route_uses_refresh_grant() {
        let (token_url, seen) = stub_upstream(200, r#"{"access_token":"B","expires_in":3600}"#);
        let (base, handle) = start_proxy(token_url);

        let client = HttpClient::new();
        let resp = client
            .post(format!("{}/api/refresh_token", base))
            .json(&serde_json::json!({ "refresh_token": "R" }))
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(seen.lock()[0].body.contains("grant_type=refresh_token"));

        handle.stop();
    }

    #[test]
    fn upstream_error_is_relayed_with_status_and_body() {
        let (token_url, _) = stub_upstream(401, r#"{"error":"invalid_grant"}"#);
        let (base, handle) = start_proxy(token_url);

        let client = HttpClient::new();
        let resp = client
            .post(format!("{}/api/token", base))
            .json(&serde_json::json!({ "code": "expired" }))
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);
        assert!(resp.text().unwrap().contains("invalid_grant"));

        handle.stop();
    }

    #[test]
    fn missing_code_is_rejected_locally() {
        let (token_url, seen) = stub_upstream(200, "{}");
        let (base, handle) = start_proxy(token_url);

        let client = HttpClient::new();
        let resp = client
            .post(format!("{}/api/token", base))
            .json(&serde_json::json!({}))
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        assert!(seen.lock().is_empty());

        handle.stop();
    }

    #[test]
    fn me_without_bearer_is_unauthorized() {
        let (token_url, _) = stub_upstream(200, "{}");
        let (base, handle) = start_proxy(token_url);

        let client = HttpClient::new();
        let resp = client.get(format!("{}/api/me", base)).send().unwrap();
        assert_eq!(resp.status().as_u16(), 401);

        handle.stop();
    }

    #[test]
    fn unknown_route_is_404_with_cors_header() {
        let (token_url, _) = stub_upstream(200, "{}");
        let (base, handle) = start_proxy(token_url);

        let client = HttpClient::new();
        let resp = client.get(format!("{}/api/nope", base)).send().unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("http://localhost:3000")
        );

        handle.stop();
    }
}
