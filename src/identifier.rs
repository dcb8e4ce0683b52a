//! Case identifier rendering, parsing and matching.
//!
//! Identifiers follow the origin's format
//! `{partition_code}{instance_code}-{yy}-00-{case_type}/{sequence}`,
//! e.g. `7194-25-00-4/215`. Sequence numbers are monotonic within one
//! (partition, year) but not dense, and the origin occasionally renders a
//! duplicate of a record with a trailing `"(N)"` marker.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static CASE_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)-(\d+)-(\d+)-([0-9a-zA-Zа-яА-Я]+)/(\d+)(?:\((\d+)\))?$")
        .expect("case number pattern is valid")
});

/// One logical partition of the identifier space: a territory code plus a
/// sub-partition instance and case-type code, together with the opaque form
/// values the origin expects when selecting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Short key used in configuration, logs and the store.
    pub key: String,
    /// Human-readable name for reports.
    #[serde(default)]
    pub name: String,
    /// Numeric territory code, e.g. `"719"`.
    pub partition_code: String,
    /// Sub-partition instance code appended to the territory code.
    pub instance_code: String,
    /// Case-type code rendered after the fixed `00` segment.
    pub case_type_code: String,
    /// Origin form value for the district select.
    pub district_id: String,
    /// Origin form value for the court select.
    pub court_id: String,
}

impl Partition {
    /// Concatenated code as it appears at the front of rendered identifiers.
    pub fn court_code(&self) -> String {
        format!("{}{}", self.partition_code, self.instance_code)
    }

    /// Render the identifier for one sequence number.
    pub fn render_case_number(&self, year: &str, sequence: u32) -> String {
        format!(
            "{}{}-{}-00-{}/{}",
            self.partition_code,
            self.instance_code,
            short_year(year),
            self.case_type_code,
            sequence
        )
    }
}

/// Components of a rendered case number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCaseNumber {
    pub court_code: String,
    pub year_short: String,
    pub case_type: String,
    pub sequence: u32,
    /// Trailing duplicate marker index, when present.
    pub duplicate: Option<u32>,
}

impl ParsedCaseNumber {
    /// Full four-digit year, assuming the origin's 20xx numbering.
    pub fn full_year(&self) -> String {
        format!("20{:0>2}", self.year_short)
    }
}

/// Parse a rendered case number; `None` when the shape does not match.
pub fn parse_case_number(raw: &str) -> Option<ParsedCaseNumber> {
    let caps = CASE_NUMBER_RE.captures(raw.trim())?;
    Some(ParsedCaseNumber {
        court_code: caps[1].to_string(),
        year_short: caps[2].to_string(),
        case_type: caps[4].to_string(),
        sequence: caps[5].parse().ok()?,
        duplicate: caps.get(6).and_then(|m| m.as_str().parse().ok()),
    })
}

/// Whether a result-row identifier refers to the target identifier.
///
/// Exact matches count, as does the target followed by a `"(N)"` duplicate
/// marker. Anything else does not, including longer sequence numbers that
/// merely share a prefix.
pub fn matches_target(target: &str, candidate: &str) -> bool {
    if candidate == target {
        return true;
    }
    match candidate.strip_prefix(target) {
        Some(rest) => {
            rest.len() >= 3
                && rest.starts_with('(')
                && rest.ends_with(')')
                && rest[1..rest.len() - 1].bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Last two digits of a year string ("2025" -> "25").
fn short_year(year: &str) -> &str {
    if year.len() >= 2 {
        &year[year.len() - 2..]
    } else {
        year
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition {
            key: "central".into(),
            name: "Central district".into(),
            partition_code: "719".into(),
            instance_code: "4".into(),
            case_type_code: "4".into(),
            district_id: "12".into(),
            court_id: "7".into(),
        }
    }

    #[test]
    fn renders_case_number() {
        let p = partition();
        assert_eq!(p.render_case_number("2025", 215), "7194-25-00-4/215");
        assert_eq!(p.render_case_number("25", 1), "7194-25-00-4/1");
    }

    #[test]
    fn parses_rendered_number() {
        let parsed = parse_case_number("7194-25-00-4/215").unwrap();
        assert_eq!(parsed.court_code, "7194");
        assert_eq!(parsed.year_short, "25");
        assert_eq!(parsed.case_type, "4");
        assert_eq!(parsed.sequence, 215);
        assert_eq!(parsed.duplicate, None);
        assert_eq!(parsed.full_year(), "2025");
    }

    #[test]
    fn parses_duplicate_marker() {
        let parsed = parse_case_number("7194-25-00-4/215(2)").unwrap();
        assert_eq!(parsed.sequence, 215);
        assert_eq!(parsed.duplicate, Some(2));
    }

    #[test]
    fn rejects_malformed_numbers() {
        assert!(parse_case_number("not-a-case").is_none());
        assert!(parse_case_number("7194-25-00-4/").is_none());
        assert!(parse_case_number("7194-25-00-4/215(x)").is_none());
    }

    #[rstest::rstest]
    #[case("7194-25-00-4/215", true)]
    #[case("7194-25-00-4/215(2)", true)]
    #[case("7194-25-00-4/215(11)", true)]
    #[case("7194-25-00-4/2150", false)]
    #[case("7194-25-00-4/216", false)]
    #[case("7194-25-00-4/215()", false)]
    #[case("7194-25-00-4/215(2x)", false)]
    fn target_matching(#[case] candidate: &str, #[case] expected: bool) {
        assert_eq!(matches_target("7194-25-00-4/215", candidate), expected);
    }
}
