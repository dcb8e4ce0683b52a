//! HTTP session ownership.
//!
//! One `SessionManager` holds one transport (cookie jar, relaxed TLS) and is
//! exclusively owned by one worker: the origin keeps per-session form state
//! server-side, so a transport must never be shared across partitions.
//! Every request is paced by a per-session rate limiter and driven through
//! the retry strategy with the shared circuit breaker attached; this is the
//! single layer that reports attempt outcomes to the breaker.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::OriginConfig;
use crate::error::{HarvestError, Result};
use crate::resilience::{CircuitBreaker, RetryPolicy, RetryStrategy};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Authentication state of the session this manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Invalidated,
}

/// Header profile for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Plain page navigation.
    Page,
    /// Stateful partial-update call; the origin rejects these without the
    /// framework's AJAX markers.
    Ajax,
}

/// Owns one transport and routes requests through retry + breaker.
pub struct SessionManager {
    origin: OriginConfig,
    base_url: Url,
    client: Option<Client>,
    auth_state: AuthState,
    session_id: Uuid,
    limiter: Arc<DirectLimiter>,
    retry: RetryStrategy,
}

impl SessionManager {
    pub fn new(
        origin: OriginConfig,
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let base_url = Url::parse(&origin.base_url)
            .map_err(|e| HarvestError::Config(format!("invalid base url: {e}")))?;
        let rps = NonZeroU32::new(origin.max_requests_per_second.max(1))
            .expect("max(1) is non-zero");
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));
        Ok(Self {
            origin,
            base_url,
            client: None,
            auth_state: AuthState::Unauthenticated,
            session_id: Uuid::new_v4(),
            limiter,
            retry: RetryStrategy::with_breaker(policy, breaker),
        })
    }

    /// Discard the current transport and build a fresh one. Cookies and any
    /// server-side session state die with the old client.
    pub fn recreate_transport(&mut self) -> Result<()> {
        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(self.origin.accept_invalid_certs)
            .timeout(Duration::from_secs(self.origin.timeout_secs))
            .user_agent(&self.origin.user_agent)
            .gzip(true)
            .build()
            .map_err(|e| HarvestError::Config(format!("cannot build HTTP client: {e}")))?;
        self.client = Some(client);
        self.auth_state = AuthState::Unauthenticated;
        self.session_id = Uuid::new_v4();
        debug!(session = %self.session_id, "created fresh session transport");
        Ok(())
    }

    /// Drop the transport entirely; the session is done.
    pub fn invalidate(&mut self) {
        if self.client.take().is_some() {
            debug!(session = %self.session_id, "session transport closed");
        }
        self.auth_state = AuthState::Invalidated;
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state
    }

    pub fn set_auth_state(&mut self, state: AuthState) {
        self.auth_state = state;
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path against the origin.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| HarvestError::Config(format!("invalid path {path}: {e}")))
    }

    fn transport(&mut self) -> Result<Client> {
        if self.client.is_none() {
            self.recreate_transport()?;
        }
        Ok(self.client.clone().expect("transport just created"))
    }

    fn headers(&self, kind: RequestKind, referer: Option<&Url>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match kind {
            RequestKind::Page => {
                headers.insert(
                    reqwest::header::ACCEPT,
                    HeaderValue::from_static(
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                    ),
                );
            }
            RequestKind::Ajax => {
                headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded;charset=UTF-8"),
                );
                headers.insert("Faces-Request", HeaderValue::from_static("partial/ajax"));
                headers.insert(
                    "X-Requested-With",
                    HeaderValue::from_static("XMLHttpRequest"),
                );
            }
        }
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("ru,en;q=0.9"),
        );
        if let Some(referer) = referer {
            if let Ok(value) = HeaderValue::from_str(referer.as_str()) {
                headers.insert(reqwest::header::REFERER, value);
            }
        }
        headers
    }

    /// GET a page and return its body.
    pub async fn get_text(&mut self, url: Url) -> Result<String> {
        self.request_text(Method::GET, url, None, RequestKind::Page, None)
            .await
    }

    /// POST a form and return the response body.
    pub async fn post_form_text(
        &mut self,
        url: Url,
        form: Vec<(String, String)>,
        kind: RequestKind,
        referer: Option<Url>,
    ) -> Result<String> {
        self.request_text(Method::POST, url, Some(form), kind, referer)
            .await
    }

    async fn request_text(
        &mut self,
        method: Method,
        url: Url,
        form: Option<Vec<(String, String)>>,
        kind: RequestKind,
        referer: Option<Url>,
    ) -> Result<String> {
        let client = self.transport()?;
        let headers = self.headers(kind, referer.as_ref());
        let limiter = Arc::clone(&self.limiter);
        let context = format!("{} {}", method, url.path());

        self.retry
            .execute(&context, || {
                let client = client.clone();
                let method = method.clone();
                let url = url.clone();
                let headers = headers.clone();
                let form = form.clone();
                let limiter = Arc::clone(&limiter);
                async move {
                    limiter.until_ready().await;
                    let mut request = client.request(method, url).headers(headers);
                    if let Some(form) = &form {
                        request = request.form(form);
                    }
                    let response = request.send().await?;
                    let status = response.status().as_u16();
                    if let Some(err) = HarvestError::from_status(status) {
                        return Err(err);
                    }
                    Ok(response.text().await?)
                }
            })
            .await
    }
}
