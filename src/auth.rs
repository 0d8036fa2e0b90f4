use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tiny_http::{Header, Method, Response, Server};
use tracing::warn;
use url::Url;

use crate::reddit::Profile;
use crate::storage::{self, StoredSession};

static HTML_SUCCESS: Lazy<String> = Lazy::new(|| {
    r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>Orangered Authorization Complete</title>
  </head>
  <body>
    <main>
      <h1>Authorization Complete</h1>
      <p>Orangered is now connected to your Reddit account. You can close this tab.</p>
    </main>
  </body>
</html>"#
        .to_string()
});

const STATE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const STATE_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization code or token missing")]
    MissingCredentials,
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("token exchange failed: {status}: {body}")]
    ExchangeFailed { status: u16, body: String },
    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authorization code already exchanged")]
    CodeAlreadyUsed,
    #[error("secure random source unavailable")]
    InsecureRandom,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub scope: Vec<String>,
    pub user_agent: String,
    pub auth_url: String,
    /// Base URL of the trusted proxy that holds the client secret. The
    /// browser-side flow never talks to the token endpoint directly.
    pub api_base: String,
    pub redirect_uri: String,
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            scope: vec![
                "identity".into(),
                "read".into(),
                "submit".into(),
                "vote".into(),
            ],
            user_agent: "orangered-dev/0.1".into(),
            auth_url: "https://www.reddit.com/api/v1/authorize".into(),
            api_base: "http://127.0.0.1:3001/api".into(),
            redirect_uri: "http://127.0.0.1:3000/callback".into(),
            http_timeout: Duration::from_secs(20),
        }
    }
}

/// What the proxy hands back for both the code exchange and a refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

pub struct Flow {
    cfg: Config,
    store: Arc<storage::Store>,
    client: HttpClient,
    pending_state: Mutex<Option<String>>,
    // Idempotency keys: a code lands here before any network I/O, so a
    // second handler instance can never exchange the same code twice.
    exchanged: Mutex<HashSet<String>>,
}

pub struct AuthorizationRequest {
    pub browser_url: String,
    pub redirect_uri: String,
    rx: Receiver<CallbackParams>,
    shutdown: Sender<()>,
}

impl AuthorizationRequest {
    /// Blocks until the loopback listener captures the redirect.
    pub fn wait(&self) -> Result<CallbackParams> {
        self.rx
            .recv()
            .map_err(|err| anyhow!("auth: wait for redirect: {}", err))
    }
}

impl Drop for AuthorizationRequest {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Raw query parameters captured from the redirect, uninterpreted; the
/// callback handler owns validation.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    pub fn from_query(url: &Url) -> Self {
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        Self {
            code: params.get("code").filter(|c| !c.is_empty()).cloned(),
            state: params.get("state").cloned(),
            error: params.get("error").cloned(),
        }
    }
}

impl Flow {
    pub fn new(store: Arc<storage::Store>, cfg: Config) -> Result<Self> {
        if cfg.user_agent.trim().is_empty() {
            anyhow::bail!("auth: user agent is required");
        }
        let client = HttpClient::builder()
            .timeout(cfg.http_timeout)
            .build()
            .context("auth: build http client")?;

        Ok(Self {
            cfg,
            store,
            client,
            pending_state: Mutex::new(None),
            exchanged: Mutex::new(HashSet::new()),
        })
    }

    /// Starts the authorization redirect: generates the CSRF nonce, parks it
    /// as the pending state, and opens a one-shot loopback listener on the
    /// redirect URI. The caller sends `browser_url` to the user agent.
    pub fn begin(&self) -> Result<AuthorizationRequest> {
        if self.cfg.client_id.trim().is_empty() {
            anyhow::bail!("auth: client id is required");
        }
        let state = random_state()?;
        *self.pending_state.lock() = Some(state.clone());

        let redirect = Url::parse(&self.cfg.redirect_uri)?;
        let host = redirect.host_str().unwrap_or("127.0.0.1");
        let port = redirect.port().unwrap_or(0);
        let path = if redirect.path().is_empty() {
            "/"
        } else {
            redirect.path()
        };

        let listen_addr = format!("{}:{}", host, port);
        let server = Server::http(&listen_addr).map_err(|err| anyhow!("auth: listen: {}", err))?;
        let actual_addr = server.server_addr();
        let actual_redirect = Url::parse(&format!("http://{}{}", actual_addr, path))?;

        let browser_url = self.authorize_url(actual_redirect.as_str(), &state)?;

        let (result_tx, result_rx) = bounded::<CallbackParams>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        thread::spawn(move || {
            for request in server.incoming_requests() {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                if capture_redirect(request, &result_tx) {
                    break;
                }
            }
        });

        Ok(AuthorizationRequest {
            browser_url,
            redirect_uri: actual_redirect.to_string(),
            rx: result_rx,
            shutdown: shutdown_tx,
        })
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String> {
        let mut auth = Url::parse(&self.cfg.auth_url)?;
        auth.query_pairs_mut()
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("duration", "permanent")
            .append_pair("scope", &self.cfg.scope.join(" "));
        Ok(auth.to_string())
    }

    /// Consumes the pending CSRF nonce. One take per flow start; a second
    /// caller sees `None` and must fail validation.
    pub fn take_pending_state(&self) -> Option<String> {
        self.pending_state.lock().take()
    }

    pub fn code_was_exchanged(&self, code: &str) -> bool {
        self.exchanged.lock().contains(code)
    }

    /// Exchanges an authorization code through the proxy. Reddit invalidates
    /// a code on first use, so the code is claimed before the request goes
    /// out; a duplicate claim returns `CodeAlreadyUsed` with no network call.
    pub fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
        if code.trim().is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        if !self.exchanged.lock().insert(code.to_string()) {
            return Err(AuthError::CodeAlreadyUsed);
        }

        let url = self.endpoint("token");
        let resp = self
            .client
            .post(url)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .json(&serde_json::json!({ "code": code }))
            .send()?;
        let grant = self.grant_from_response(resp)?;
        self.persist(&grant)?;
        Ok(grant)
    }

    /// Mints a new access token from a refresh token. Not retried here: a
    /// failed refresh means the caller clears the whole session and forces
    /// re-authentication.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        if refresh_token.trim().is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let url = self.endpoint("refresh_token");
        let resp = self
            .client
            .post(url)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()?;
        let mut grant = self.grant_from_response(resp)?;
        // Reddit may omit the refresh token on rotation; keep the old one.
        if grant.refresh_token.is_none() {
            grant.refresh_token = Some(refresh_token.to_string());
        }
        self.persist(&grant)?;
        Ok(grant)
    }

    pub fn fetch_profile(&self, access_token: &str) -> Result<Profile, AuthError> {
        let url = self.endpoint("me");
        let resp = self
            .client
            .get(url)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(AuthError::ProfileFetchFailed(format!("{}: {}", status, body)));
        }
        resp.json::<Profile>()
            .map_err(|err| AuthError::ProfileFetchFailed(err.to_string()))
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.cfg.api_base.trim_end_matches('/'), name)
    }

    fn grant_from_response(
        &self,
        resp: reqwest::blocking::Response,
    ) -> Result<TokenGrant, AuthError> {
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(AuthError::ExchangeFailed { status, body });
        }
        let payload: TokenResponse = resp.json()?;
        if payload.access_token.is_empty() {
            return Err(AuthError::ExchangeFailed {
                status: 200,
                body: "missing access token".into(),
            });
        }
        let expires_in = if payload.expires_in == 0 {
            3600
        } else {
            payload.expires_in
        };
        Ok(TokenGrant {
            access_token: payload.access_token,
            refresh_token: if payload.refresh_token.is_empty() {
                None
            } else {
                Some(payload.refresh_token)
            },
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in as i64),
        })
    }

    fn persist(&self, grant: &TokenGrant) -> Result<(), AuthError> {
        self.store
            .save_session(&StoredSession {
                access_token: grant.access_token.clone(),
                refresh_token: grant.refresh_token.clone(),
                expires_at: grant.expires_at,
            })
            .map_err(AuthError::Other)
    }
}

/// Responds to the browser and ships the raw query parameters to the flow.
/// Returns true once a redirect was handled.
fn capture_redirect(req: tiny_http::Request, tx: &Sender<CallbackParams>) -> bool {
    if req.method() != &Method::Get {
        let _ = req.respond(Response::from_string("method not allowed").with_status_code(405));
        return false;
    }

    let url = match Url::parse(&format!("http://localhost{}", req.url())) {
        Ok(url) => url,
        Err(err) => {
            warn!(error = %err, "auth: malformed redirect request");
            let _ = req.respond(Response::from_string("bad request").with_status_code(400));
            return false;
        }
    };
    let params = CallbackParams::from_query(&url);

    let response = if params.code.is_some() {
        Response::from_string(HTML_SUCCESS.clone()).with_header(
            Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
                .expect("valid header"),
        )
    } else {
        Response::from_string("authorization failed").with_status_code(400)
    };
    let _ = req.respond(response);
    tx.send(params).ok();
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    Idle,
    Validating,
    Exchanging,
    FetchingProfile,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub grant: TokenGrant,
    pub profile: Profile,
}

/// Drives the redirect parameters through validation, exchange, and profile
/// fetch. The CSRF check runs before any network call; every failure path
/// parks the machine in `Failed`.
pub struct CallbackHandler {
    flow: Arc<Flow>,
    state: CallbackState,
}

impl CallbackHandler {
    pub fn new(flow: Arc<Flow>) -> Self {
        Self {
            flow,
            state: CallbackState::Idle,
        }
    }

    pub fn state(&self) -> CallbackState {
        self.state
    }

    pub fn handle(&mut self, params: &CallbackParams) -> Result<CallbackOutcome, AuthError> {
        self.state = CallbackState::Validating;

        let code = match params.code.as_deref() {
            Some(code) => code,
            None => return Err(self.fail(AuthError::MissingCredentials)),
        };
        let expected = match self.flow.take_pending_state() {
            Some(expected) => expected,
            None => return Err(self.fail(AuthError::StateMismatch)),
        };
        if params.state.as_deref() != Some(expected.as_str()) {
            return Err(self.fail(AuthError::StateMismatch));
        }

        self.state = CallbackState::Exchanging;
        let grant = match self.flow.exchange_code(code) {
            Ok(grant) => grant,
            Err(err) => return Err(self.fail(err)),
        };

        self.state = CallbackState::FetchingProfile;
        let profile = match self.flow.fetch_profile(&grant.access_token) {
            Ok(profile) => profile,
            Err(err) => return Err(self.fail(err)),
        };

        self.state = CallbackState::Done;
        Ok(CallbackOutcome { grant, profile })
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        self.state = CallbackState::Failed;
        err
    }
}

/// CSRF nonce from the OS entropy source. There is deliberately no fallback
/// generator: a weak state value is a broken CSRF check, so an unavailable
/// secure source is a hard error.
fn random_state() -> Result<String, AuthError> {
    let mut bytes = [0u8; STATE_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| AuthError::InsecureRandom)?;
    Ok(bytes
        .iter()
        .map(|b| STATE_ALPHABET[*b as usize % STATE_ALPHABET.len()] as char)
        .collect())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    refresh_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> Arc<storage::Store> {
        Arc::new(
            storage::Store::open(storage::Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        )
    }

    /// Stub proxy serving /token, /refresh_token, and /me while counting
    /// token requests.
    fn stub_proxy() -> (String, Arc<AtomicUsize>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api", server.server_addr());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let url = request.url().to_string();
                let body = if url.ends_with("/me") {
                    r#"{"id":"u1","name":"tester","created_utc":1500000000.0,"link_karma":10,"comment_karma":5}"#
                } else {
                    counter.fetch_add(1, Ordering::SeqCst);
                    r#"{"access_token":"fresh","refresh_token":"next","expires_in":3600}"#
                };
                let response = Response::from_string(body).with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                );
                let _ = request.respond(response);
            }
        });
        (base, hits)
    }

    fn flow_with(dir: &tempfile::TempDir, api_base: String) -> Arc<Flow> {
        let cfg = Config {
            client_id: "client".into(),
            api_base,
            ..Config::default()
        };
        Arc::new(Flow::new(open_store(dir), cfg).unwrap())
    }

    #[test]
    fn state_nonce_is_long_and_alphanumeric() {
        let state = random_state().unwrap();
        assert!(state.len() >= 16);
        assert!(state.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(state, random_state().unwrap());
    }

    #[test]
    fn authorize_url_carries_required_params() {
        let dir = tempdir().unwrap();
        let flow = flow_with(&dir, "http://127.0.0.1:9/api".into());
        let url = flow
            .authorize_url("http://127.0.0.1:3000/callback", "nonce123")
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("state").map(String::as_str), Some("nonce123"));
        assert_eq!(params.get("duration").map(String::as_str), Some("permanent"));
        assert!(params.get("scope").unwrap().contains("identity"));
    }

    #[test]
    fn exchange_runs_at_most_once_per_code() {
        let dir = tempdir().unwrap();
        let (base, hits) = stub_proxy();
        let flow = flow_with(&dir, base);

        let grant = flow.exchange_code("XYZ").unwrap();
        assert_eq!(grant.access_token, "fresh");
        assert!(matches!(
            flow.exchange_code("XYZ"),
            Err(AuthError::CodeAlreadyUsed)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exchange_persists_session() {
        let dir = tempdir().unwrap();
        let (base, _) = stub_proxy();
        let flow = flow_with(&dir, base);

        flow.exchange_code("CODE").unwrap();
        let stored = open_store(&dir).load_session().unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_token, Some("next".into()));
        assert!(stored.expires_at > Utc::now());
    }

    #[test]
    fn exchange_failure_carries_upstream_status_and_body() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api", server.server_addr());
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let _ = request.respond(
                    Response::from_string(r#"{"error":"invalid_grant"}"#).with_status_code(400),
                );
            }
        });

        let dir = tempdir().unwrap();
        let flow = flow_with(&dir, base);
        match flow.exchange_code("BAD") {
            Err(AuthError::ExchangeFailed { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected: {:?}", other.map(|g| g.access_token)),
        }
    }

    #[test]
    fn callback_state_mismatch_fails_before_any_network_call() {
        let dir = tempdir().unwrap();
        // Unroutable api base: any network attempt would error differently.
        let flow = flow_with(&dir, "http://127.0.0.1:9/api".into());
        *flow.pending_state.lock() = Some("expected".into());

        let mut handler = CallbackHandler::new(flow.clone());
        let params = CallbackParams {
            code: Some("XYZ".into()),
            state: Some("forged".into()),
            error: None,
        };
        assert!(matches!(
            handler.handle(&params),
            Err(AuthError::StateMismatch)
        ));
        assert_eq!(handler.state(), CallbackState::Failed);
        assert!(!flow.code_was_exchanged("XYZ"));
    }

    #[test]
    fn callback_missing_code_fails_without_consuming_state() {
        let dir = tempdir().unwrap();
        let flow = flow_with(&dir, "http://127.0.0.1:9/api".into());
        *flow.pending_state.lock() = Some("expected".into());

        let mut handler = CallbackHandler::new(flow.clone());
        assert!(matches!(
            handler.handle(&CallbackParams::default()),
            Err(AuthError::MissingCredentials)
        ));
        assert_eq!(handler.state(), CallbackState::Failed);
    }

    #[test]
    fn two_handlers_one_exchange() {
        let dir = tempdir().unwrap();
        let (base, hits) = stub_proxy();
        let flow = flow_with(&dir, base);
        *flow.pending_state.lock() = Some("nonce".into());

        let params = CallbackParams {
            code: Some("XYZ".into()),
            state: Some("nonce".into()),
            error: None,
        };

        let mut first = CallbackHandler::new(flow.clone());
        let outcome = first.handle(&params).unwrap();
        assert_eq!(first.state(), CallbackState::Done);
        assert_eq!(outcome.profile.name, "tester");

        // A second mount replays the same redirect; the nonce is gone and
        // the code is claimed, so nothing further reaches the proxy.
        let mut second = CallbackHandler::new(flow.clone());
        assert!(second.handle(&params).is_err());
        assert_eq!(second.state(), CallbackState::Failed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_keeps_old_refresh_token_when_omitted() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api", server.server_addr());
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let _ = request.respond(Response::from_string(
                    r#"{"access_token":"fresh","expires_in":3600}"#,
                ));
            }
        });

        let dir = tempdir().unwrap();
        let flow = flow_with(&dir, base);
        let grant = flow.refresh("OLD").unwrap();
        assert_eq!(grant.refresh_token, Some("OLD".into()));
    }

    #[test]
    fn redirect_capture_extracts_query() {
        let url = Url::parse("http://localhost/callback?code=abc&state=xyz").unwrap();
        let params = CallbackParams::from_query(&url);
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert!(params.error.is_none());
    }
}
