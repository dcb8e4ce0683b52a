//! Result-page parsing, limited to what the core needs: did the query
//! succeed, and which rendered identifiers came back.
//!
//! Field-level extraction of the result table is a collaborator concern;
//! the shipped parser only reads the identifier cell and the origin's
//! no-results message (served in either of its two locales).

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One result row, opaque to the core beyond its identifier and position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Rendered case identifier as the origin printed it.
    pub case_number: String,
    /// Row index in the origin's result table, kept for follow-up fetches.
    pub result_index: usize,
}

/// Collaborator interface: turn a result page into records.
pub trait RecordParser: Send + Sync {
    fn parse(&self, html: &str) -> Result<Vec<Record>>;
}

const NO_RESULTS_MESSAGES: [&str; 2] = [
    "По указанным данным ничего не найдено",
    "Көрсетілген деректер бойына ешнәрсе табылмады",
];

static CONTENT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".tab__inner-content").expect("valid selector"));
static TABLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table").expect("valid selector"));
static ROW_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tbody tr").expect("valid selector"));
static CELL_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("valid selector"));
static PARAGRAPH_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p").expect("valid selector"));

/// Minimal table reader for the origin's result page.
#[derive(Debug, Default)]
pub struct ResultTableParser;

impl ResultTableParser {
    pub fn new() -> Self {
        Self
    }

    fn is_no_results(document: &Html) -> bool {
        let Some(content) = document.select(&CONTENT_SELECTOR).next() else {
            // No content pane at all: nothing to read.
            return true;
        };
        let text: String = content.text().collect();
        NO_RESULTS_MESSAGES.iter().any(|msg| text.contains(msg))
    }
}

impl RecordParser for ResultTableParser {
    fn parse(&self, html: &str) -> Result<Vec<Record>> {
        let document = Html::parse_document(html);

        if Self::is_no_results(&document) {
            return Ok(Vec::new());
        }

        let Some(table) = document.select(&TABLE_SELECTOR).next() else {
            tracing::warn!("result page carried content but no table");
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for (index, row) in table.select(&ROW_SELECTOR).enumerate() {
            let Some(first_cell) = row.select(&CELL_SELECTOR).next() else {
                continue;
            };
            // The identifier sits in the cell's first paragraph; fall back
            // to the whole cell for degenerate markup.
            let raw: String = first_cell
                .select(&PARAGRAPH_SELECTOR)
                .next()
                .map(|p| p.text().collect())
                .unwrap_or_else(|| first_cell.text().collect());
            let case_number = clean(&raw);
            if case_number.is_empty() {
                continue;
            }
            records.push(Record {
                case_number,
                result_index: index,
            });
        }
        Ok(records)
    }
}

/// Collapse runs of whitespace, as the origin pads cells with newlines.
fn clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
