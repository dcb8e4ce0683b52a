//! Stateful search protocol.
//!
//! Every query is a two-phase exchange: fetch the search page for a fresh
//! single-use continuation token (the origin rejects reuse), then drive the
//! stateful AJAX form (partition select, then query submit) and fetch the
//! rendered result page. Form field identifiers are scraped once per session
//! into a typed [`SearchForm`] capability record; the cache must be dropped
//! whenever re-authentication occurs because the markup is re-rendered.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tokio::time::sleep;
use tracing::debug;

use crate::config::PacingConfig;
use crate::error::{HarvestError, Result};
use crate::identifier::Partition;
use crate::session::{RequestKind, SessionManager};

const SEARCH_PAGE_PATH: &str = "/form/lawsuit/";
const SEARCH_ACTION_PATH: &str = "/form/lawsuit/index.xhtml";
const RESULTS_PATH: &str = "/lawsuit/lawsuitList.xhtml";

static TOKEN_INPUT: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"input[name="javax.faces.ViewState"]"#).expect("valid selector")
});
static NUMBER_FIELD: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"[id*="edit-num"]"#).expect("valid selector"));

/// Pull the continuation token out of a page render.
pub fn extract_continuation_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&TOKEN_INPUT)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::to_string)
}

/// What goes into the number field of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStyle {
    /// The full rendered identifier; used by forward scans and gap fill.
    FullNumber,
    /// Only the bare sequence component; used when refreshing records the
    /// origin already knows under their full number.
    SequenceOnly,
}

/// Value submitted in the number field for a target identifier.
pub fn query_number(target: &str, style: QueryStyle) -> String {
    match style {
        QueryStyle::FullNumber => target.to_string(),
        QueryStyle::SequenceOnly => target
            .rsplit_once('/')
            .map(|(_, seq)| seq.to_string())
            .unwrap_or_else(|| target.to_string()),
    }
}

/// Typed capability record for the search form, scraped from one session's
/// render and valid only for that session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchForm {
    form_base: String,
}

impl SearchForm {
    /// Field name for one of the form's `edit-*` inputs.
    pub fn field(&self, suffix: &str) -> String {
        format!("{}:{}", self.form_base, suffix)
    }

    pub fn form_base(&self) -> &str {
        &self.form_base
    }

    /// The search submit button identifier derived from the form base.
    pub fn search_button(&self) -> String {
        format!("{}:j_idt83", self.form_base)
    }
}

/// Scrape and validate the search form's identifiers.
pub fn scrape_search_form(html: &str) -> Result<SearchForm> {
    let document = Html::parse_document(html);
    let number_input = document
        .select(&NUMBER_FIELD)
        .next()
        .ok_or_else(|| HarvestError::FormCapability("number field not found".into()))?;
    let name = number_input
        .value()
        .attr("name")
        .or_else(|| number_input.value().attr("id"))
        .unwrap_or_default();
    let form_base = name
        .rsplit_once(':')
        .map(|(base, _)| base.to_string())
        .ok_or_else(|| {
            HarvestError::FormCapability(format!("number field has no form prefix: {name}"))
        })?;
    Ok(SearchForm { form_base })
}

/// Drives one session's search exchanges.
pub struct SearchProtocol {
    pacing: PacingConfig,
}

impl SearchProtocol {
    pub fn new(pacing: PacingConfig) -> Self {
        Self { pacing }
    }

    /// Fetch the search page: a fresh single-use token plus the scraped
    /// form capabilities. Callers cache the form per session, never the
    /// token.
    pub async fn prepare(&self, session: &mut SessionManager) -> Result<(String, SearchForm)> {
        let url = session.url(SEARCH_PAGE_PATH)?;
        let html = session.get_text(url).await?;
        let token = extract_continuation_token(&html).ok_or_else(|| HarvestError::TokenMissing {
            page: "search form".into(),
        })?;
        let form = scrape_search_form(&html)?;
        debug!(form_base = %form.form_base(), "search form prepared");
        Ok((token, form))
    }

    /// Select the partition in the stateful form.
    pub async fn select_partition(
        &self,
        session: &mut SessionManager,
        token: &str,
        form: &SearchForm,
        partition: &Partition,
    ) -> Result<()> {
        let url = session.url(SEARCH_ACTION_PATH)?;
        let district_field = form.field("edit-district");
        let payload = vec![
            (form.form_base().to_string(), form.form_base().to_string()),
            (district_field.clone(), partition.district_id.clone()),
            (form.field("edit-district-hide"), String::new()),
            (form.field("edit-court"), String::new()),
            (form.field("edit-year"), String::new()),
            (form.field("edit-iin"), String::new()),
            (form.field("edit-num"), String::new()),
            (form.field("edit-fio"), String::new()),
            ("javax.faces.ViewState".to_string(), token.to_string()),
            ("javax.faces.source".to_string(), district_field.clone()),
            ("javax.faces.partial.event".to_string(), "change".to_string()),
            (
                "javax.faces.partial.execute".to_string(),
                format!("{district_field} @component"),
            ),
            ("javax.faces.partial.render".to_string(), "@component".to_string()),
            ("javax.faces.behavior.event".to_string(), "change".to_string()),
            (
                "org.richfaces.ajax.component".to_string(),
                district_field.clone(),
            ),
            ("rfExt".to_string(), "null".to_string()),
            ("AJAX:EVENTS_COUNT".to_string(), "1".to_string()),
            ("javax.faces.partial.ajax".to_string(), "true".to_string()),
        ];
        session
            .post_form_text(url, payload, RequestKind::Ajax, None)
            .await?;
        debug!(partition = %partition.key, "partition selected");
        Ok(())
    }

    /// Submit the query and fetch the rendered result page.
    pub async fn submit_query(
        &self,
        session: &mut SessionManager,
        token: &str,
        form: &SearchForm,
        partition: &Partition,
        year: &str,
        target: &str,
        style: QueryStyle,
    ) -> Result<String> {
        let url = session.url(SEARCH_ACTION_PATH)?;
        let button = form.search_button();
        let number = query_number(target, style);
        let payload = vec![
            (form.form_base().to_string(), form.form_base().to_string()),
            (form.field("edit-district"), partition.district_id.clone()),
            (form.field("edit-district-hide"), partition.district_id.clone()),
            (form.field("edit-court"), partition.court_id.clone()),
            (form.field("edit-year"), year.to_string()),
            (form.field("edit-iin"), String::new()),
            (form.field("edit-num"), number),
            (form.field("edit-fio"), String::new()),
            ("javax.faces.ViewState".to_string(), token.to_string()),
            ("javax.faces.source".to_string(), button.clone()),
            (
                "javax.faces.partial.execute".to_string(),
                format!("{button} @component"),
            ),
            ("javax.faces.partial.render".to_string(), "@component".to_string()),
            ("param1".to_string(), form.field("edit-num")),
            ("org.richfaces.ajax.component".to_string(), button.clone()),
            (button.clone(), button),
            ("rfExt".to_string(), "null".to_string()),
            ("AJAX:EVENTS_COUNT".to_string(), "1".to_string()),
            ("javax.faces.partial.ajax".to_string(), "true".to_string()),
        ];
        session
            .post_form_text(url, payload, RequestKind::Ajax, None)
            .await?;

        // The origin renders results server-side after the partial update;
        // fetching too early returns the previous page.
        sleep(self.pacing.render_delay()).await;

        let results_url = session.url(RESULTS_PATH)?;
        let html = session.get_text(results_url).await?;
        debug!(target, "query submitted, results fetched");
        Ok(html)
    }

    /// Pause applied between partition selection and query submission.
    pub async fn settle(&self) {
        sleep(self.pacing.render_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_continuation_token() {
        let html = r#"
            <form><input type="hidden" name="javax.faces.ViewState"
                         value="4150051668713664914:-3917871925134164983"/></form>"#;
        assert_eq!(
            extract_continuation_token(html).unwrap(),
            "4150051668713664914:-3917871925134164983"
        );
        assert!(extract_continuation_token("<html></html>").is_none());
    }

    #[test]
    fn scrapes_form_base_from_number_field() {
        let html = r#"<input id="j_idt45:j_idt46:edit-num"
                             name="j_idt45:j_idt46:edit-num" type="text"/>"#;
        let form = scrape_search_form(html).unwrap();
        assert_eq!(form.form_base(), "j_idt45:j_idt46");
        assert_eq!(form.field("edit-year"), "j_idt45:j_idt46:edit-year");
        assert_eq!(form.search_button(), "j_idt45:j_idt46:j_idt83");
    }

    #[test]
    fn missing_number_field_is_a_capability_error() {
        assert!(matches!(
            scrape_search_form("<html><body></body></html>"),
            Err(HarvestError::FormCapability(_))
        ));
    }

    #[test]
    fn query_number_styles() {
        assert_eq!(
            query_number("7194-25-00-4/215", QueryStyle::FullNumber),
            "7194-25-00-4/215"
        );
        assert_eq!(
            query_number("7194-25-00-4/215", QueryStyle::SequenceOnly),
            "215"
        );
        assert_eq!(query_number("215", QueryStyle::SequenceOnly), "215");
    }
}
