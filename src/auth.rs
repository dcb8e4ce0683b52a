//! Four-step login state machine.
//!
//! The origin's login is a stateful form exchange: every step must echo the
//! freshest continuation token, the credential form's field and button
//! identifiers change between page renders and must be re-scraped every
//! attempt, and success can only be confirmed by fetching a protected page
//! and counting known authenticated-page markers.
//!
//! The whole sequence is wrapped by a retry strategy; a failed attempt
//! discards the transport and restarts from step one. Partial progress is
//! never resumed; the origin's session state cannot be trusted after a
//! mid-login failure.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{AuthConfig, PacingConfig};
use crate::error::{HarvestError, Result};
use crate::resilience::{RetryPolicy, RetryStrategy};
use crate::search::extract_continuation_token;
use crate::session::{AuthState, RequestKind, SessionManager};

const LOGIN_PATH: &str = "/index.xhtml";
const VERIFY_PATH: &str = "/form/proceedings/services.xhtml";

/// Locale-switch component identifiers; these are the one stable part of
/// the landing page.
const LOCALE_FORM: &str = "f_l_temp";
const LOCALE_COMPONENT: &str = "f_l_temp:js_temp_1";

/// Markers present on protected pages once a session is authenticated. The
/// page must show at least [`REQUIRED_MARKERS`] of them.
const AUTHENTICATED_MARKERS: [&str; 4] =
    ["profile-context-menu", "Выйти", "logout()", "userInfo.xhtml"];
const REQUIRED_MARKERS: usize = 3;

/// Submit-button labels across the origin's locales.
const SUBMIT_LABELS: [&str; 3] = ["войти", "login", "кіру"];

static EMAIL_INPUT: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"input[type="email"]"#).expect("valid selector"));
static PASSWORD_INPUT: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"input[type="password"]"#).expect("valid selector"));
static SUBMIT_INPUT: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"input[type="submit"]"#).expect("valid selector"));
static PRIMARY_SUBMIT: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#".button-primary[type="submit"]"#).expect("valid selector"));

/// Field and button identifiers scraped from one render of the login form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    pub form_base: String,
    pub login_field: String,
    pub password_field: String,
    pub submit_button: String,
}

/// Scrape the credential form out of a login-page render.
///
/// Identifiers are generated per render, so nothing here can be cached.
pub fn scrape_login_form(html: &str) -> Result<LoginForm> {
    let document = Html::parse_document(html);

    let login_field = document
        .select(&EMAIL_INPUT)
        .next()
        .and_then(|input| {
            input
                .value()
                .attr("name")
                .or_else(|| input.value().attr("id"))
        })
        .map(str::to_string)
        .ok_or_else(|| HarvestError::FormCapability("login field not found".into()))?;

    let form_base = login_field
        .rsplit_once(':')
        .map(|(base, _)| base.to_string())
        .ok_or_else(|| {
            HarvestError::FormCapability(format!("login field has no form prefix: {login_field}"))
        })?;

    let password_field = document
        .select(&PASSWORD_INPUT)
        .next()
        .and_then(|input| {
            input
                .value()
                .attr("name")
                .or_else(|| input.value().attr("id"))
        })
        .map(str::to_string)
        .unwrap_or_else(|| format!("{form_base}:password"));

    let submit_button = find_submit_button(&document).unwrap_or_else(|| {
        // The origin has served a fixed fallback identifier for years.
        let fallback = format!("{form_base}:j_idt89");
        warn!(button = %fallback, "submit button not found, using fallback identifier");
        fallback
    });

    Ok(LoginForm {
        form_base,
        login_field,
        password_field,
        submit_button,
    })
}

fn find_submit_button(document: &Html) -> Option<String> {
    for button in document.select(&SUBMIT_INPUT) {
        let value = button.value().attr("value").unwrap_or("").trim();
        if SUBMIT_LABELS.contains(&value.to_lowercase().as_str()) {
            if let Some(name) = button
                .value()
                .attr("name")
                .or_else(|| button.value().attr("id"))
            {
                return Some(name.to_string());
            }
        }
    }
    document
        .select(&PRIMARY_SUBMIT)
        .next()
        .and_then(|b| b.value().attr("name").or_else(|| b.value().attr("id")))
        .map(str::to_string)
}

/// Count authenticated-page markers in a protected-page render.
pub fn count_markers(html: &str) -> usize {
    AUTHENTICATED_MARKERS
        .iter()
        .filter(|marker| html.contains(*marker))
        .count()
}

/// Drives the login sequence over a session.
pub struct Authenticator {
    credentials: AuthConfig,
    pacing: PacingConfig,
    retry: RetryStrategy,
}

impl Authenticator {
    /// No breaker is attached here: the session layer underneath already
    /// reports every physical call, and a login failure must not count a
    /// second time.
    pub fn new(credentials: AuthConfig, pacing: PacingConfig, policy: RetryPolicy) -> Self {
        Self {
            credentials,
            pacing,
            retry: RetryStrategy::new(policy),
        }
    }

    /// Run the full login sequence, retrying per policy. Every attempt
    /// starts with a fresh transport.
    pub async fn authenticate(&self, session: &Mutex<SessionManager>) -> Result<()> {
        self.retry
            .execute("authenticate", || async {
                let mut session = session.lock().await;
                session.recreate_transport()?;
                self.login_once(&mut session).await
            })
            .await
    }

    async fn login_once(&self, session: &mut SessionManager) -> Result<()> {
        // Step 1: landing page, first continuation token.
        let landing_url = session.url("/")?;
        let html = session.get_text(landing_url.clone()).await?;
        let token = extract_continuation_token(&html).ok_or_else(|| HarvestError::TokenMissing {
            page: "landing".into(),
        })?;
        debug!("landing page loaded, token extracted");
        sleep(self.pacing.auth_step_delay()).await;

        // Step 2: switch to the parseable locale.
        self.switch_locale(session, &token, &landing_url).await?;
        sleep(self.pacing.auth_step_delay()).await;

        // Step 3: re-fetch the login form, scrape its identifiers, submit
        // credentials with the freshest token.
        self.submit_credentials(session, &token).await?;
        sleep(self.pacing.auth_step_delay()).await;

        // Step 4: verify against a protected page.
        let verify_url = session.url(VERIFY_PATH)?;
        let html = session.get_text(verify_url).await?;
        let passed = count_markers(&html);
        if passed >= REQUIRED_MARKERS {
            info!(markers = passed, "authentication verified");
            session.set_auth_state(AuthState::Authenticated);
            Ok(())
        } else {
            Err(HarvestError::Authentication(format!(
                "verification page shows {passed}/{} markers",
                AUTHENTICATED_MARKERS.len()
            )))
        }
    }

    async fn switch_locale(
        &self,
        session: &mut SessionManager,
        token: &str,
        referer: &Url,
    ) -> Result<()> {
        let url = session.url(LOGIN_PATH)?;
        let form = vec![
            (LOCALE_FORM.to_string(), LOCALE_FORM.to_string()),
            ("javax.faces.ViewState".to_string(), token.to_string()),
            ("javax.faces.source".to_string(), LOCALE_COMPONENT.to_string()),
            (
                "javax.faces.partial.execute".to_string(),
                format!("{LOCALE_COMPONENT} @component"),
            ),
            ("javax.faces.partial.render".to_string(), "@component".to_string()),
            ("param1".to_string(), referer.to_string()),
            (
                "org.richfaces.ajax.component".to_string(),
                LOCALE_COMPONENT.to_string(),
            ),
            (LOCALE_COMPONENT.to_string(), LOCALE_COMPONENT.to_string()),
            ("rfExt".to_string(), "null".to_string()),
            ("AJAX:EVENTS_COUNT".to_string(), "1".to_string()),
            ("javax.faces.partial.ajax".to_string(), "true".to_string()),
        ];
        session
            .post_form_text(url, form, RequestKind::Ajax, Some(referer.clone()))
            .await?;
        debug!("locale switched");
        Ok(())
    }

    async fn submit_credentials(&self, session: &mut SessionManager, token: &str) -> Result<()> {
        let url = session.url(LOGIN_PATH)?;
        let html = session.get_text(url.clone()).await?;
        let form = scrape_login_form(&html)?;
        // Prefer the token from the freshest render; fall back to the one
        // carried forward from the landing page.
        let token = extract_continuation_token(&html).unwrap_or_else(|| token.to_string());

        let payload = vec![
            (form.form_base.clone(), form.form_base.clone()),
            (form.login_field.clone(), self.credentials.login.clone()),
            (form.password_field.clone(), self.credentials.password.clone()),
            ("javax.faces.ViewState".to_string(), token),
            ("javax.faces.source".to_string(), form.submit_button.clone()),
            ("javax.faces.partial.event".to_string(), "click".to_string()),
            (
                "javax.faces.partial.execute".to_string(),
                format!("{} @component", form.submit_button),
            ),
            ("javax.faces.partial.render".to_string(), "@component".to_string()),
            (
                "org.richfaces.ajax.component".to_string(),
                form.submit_button.clone(),
            ),
            (form.submit_button.clone(), form.submit_button.clone()),
            ("rfExt".to_string(), "null".to_string()),
            ("AJAX:EVENTS_COUNT".to_string(), "1".to_string()),
            ("javax.faces.partial.ajax".to_string(), "true".to_string()),
        ];
        session
            .post_form_text(url.clone(), payload, RequestKind::Ajax, Some(url))
            .await?;
        debug!(form_base = %form.form_base, "credentials submitted");
        Ok(())
    }
}
