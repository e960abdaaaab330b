use super::{ColumnMap, ParseOutcome, Parser};
use crate::constants::MAX_RECORDS_PER_RUN;
use crate::error::Result;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Tag-stripping table scraper.
///
/// This is not a DOM parser: publisher pages are treated as loosely
/// structured text, `<tr>`/`<td>` boundaries are located with regexes, and unclosed
/// tags are tolerated. Names are deduplicated within one payload.
pub struct HtmlTableParser {
    source_id: String,
    max_records: usize,
}

struct Patterns {
    noise: Regex,
    row_open: Regex,
    row_close: Regex,
    cell_open: Regex,
    tag: Regex,
    numeric_entity: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        noise: Regex::new(r"(?is)<!--.*?-->|<script\b.*?</script\s*>|<style\b.*?</style\s*>")
            .expect("valid noise regex"),
        row_open: Regex::new(r"(?i)<tr\b[^>]*>").expect("valid row regex"),
        row_close: Regex::new(r"(?i)</tr\s*>|</table\s*>").expect("valid row close regex"),
        cell_open: Regex::new(r"(?i)<t([dh])\b[^>]*>").expect("valid cell regex"),
        tag: Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"),
        numeric_entity: Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid entity regex"),
    })
}

struct Row {
    cells: Vec<String>,
    is_header: bool,
}

impl HtmlTableParser {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            max_records: MAX_RECORDS_PER_RUN,
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    fn rows(html: &str) -> Vec<Row> {
        let p = patterns();
        let cleaned = p.noise.replace_all(html, " ");

        let opens: Vec<(usize, usize)> = p
            .row_open
            .find_iter(&cleaned)
            .map(|m| (m.start(), m.end()))
            .collect();
        let mut rows = Vec::with_capacity(opens.len());
        for (i, &(_, start)) in opens.iter().enumerate() {
            // A row runs until its close tag, the next row, or the end of the document
            let next_row = opens.get(i + 1).map(|&(next, _)| next).unwrap_or(cleaned.len());
            let mut fragment = &cleaned[start..next_row];
            if let Some(close) = p.row_close.find(fragment) {
                fragment = &fragment[..close.start()];
            }

            let cells_open: Vec<_> = p.cell_open.captures_iter(fragment).collect();
            if cells_open.is_empty() {
                continue;
            }
            let mut cells = Vec::with_capacity(cells_open.len());
            let mut all_th = true;
            for (j, caps) in cells_open.iter().enumerate() {
                let whole = caps.get(0).expect("group 0 always matches");
                let end = cells_open
                    .get(j + 1)
                    .and_then(|c| c.get(0))
                    .map(|m| m.start())
                    .unwrap_or(fragment.len());
                all_th &= caps[1].eq_ignore_ascii_case("h");
                cells.push(clean_cell(&fragment[whole.end()..end]));
            }
            rows.push(Row {
                cells,
                is_header: all_th,
            });
        }
        rows
    }
}

impl Parser for HtmlTableParser {
    fn parse(&self, content: &[u8]) -> Result<ParseOutcome> {
        let html = String::from_utf8_lossy(content);
        let mut outcome = ParseOutcome::default();
        let mut header: Option<ColumnMap> = None;
        let mut seen = HashSet::new();
        let mut considered = 0usize;

        for row in Self::rows(&html) {
            if row.is_header {
                if header.is_none() {
                    header = ColumnMap::from_header(&row.cells);
                }
                continue;
            }
            if considered == self.max_records {
                warn!(
                    source = %self.source_id,
                    max_records = self.max_records,
                    "record cap reached, ignoring remaining table rows"
                );
                break;
            }
            considered += 1;

            let columns = header
                .clone()
                .unwrap_or_else(|| ColumnMap::positional(row.cells.len()));
            match columns.candidate(&row.cells) {
                Some(candidate) => {
                    if seen.insert(candidate.name.clone()) {
                        outcome.candidates.push(candidate);
                    }
                }
                None => outcome.skipped += 1,
            }
        }

        debug!(
            source = %self.source_id,
            candidates = outcome.candidates.len(),
            skipped = outcome.skipped,
            "scraped html table payload"
        );
        Ok(outcome)
    }
}

/// Strip markup from a cell fragment, decode common entities and collapse whitespace
fn clean_cell(fragment: &str) -> String {
    let p = patterns();
    let text = p.tag.replace_all(fragment, " ");
    let text = p.numeric_entity.replace_all(&text, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    let text = text
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str) -> ParseOutcome {
        HtmlTableParser::new("BIS").parse(html.as_bytes()).unwrap()
    }

    #[test]
    fn extracts_rows_using_header_cells() {
        let out = parse(
            r#"<html><body><table>
                <tr><th>Country</th><th>Entity</th><th>License Requirement</th></tr>
                <tr><td>RUSSIA</td><td><b>Acme&nbsp;Corp</b></td><td>All items</td></tr>
                <tr><td>CHINA</td><td>Smith &amp; Sons</td><td>None</td></tr>
            </table></body></html>"#,
        );
        assert_eq!(out.candidates.len(), 2);
        assert_eq!(out.candidates[0].name, "Acme Corp");
        assert_eq!(out.candidates[0].country.as_deref(), Some("RUSSIA"));
        assert_eq!(
            out.candidates[0]
                .identifiers
                .get("license_requirement")
                .map(String::as_str),
            Some("All items")
        );
        assert_eq!(out.candidates[1].name, "Smith & Sons");
    }

    #[test]
    fn tolerates_unclosed_tags_and_positional_layout() {
        let out = parse("<table><tr><td>Globex<td>SDN<td>KP<tr><td>Initech<td>SDGT</table>");
        let names: Vec<&str> = out.candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Globex", "Initech"]);
        assert_eq!(out.candidates[0].program.as_deref(), Some("SDN"));
        assert_eq!(out.candidates[0].country.as_deref(), Some("KP"));
        assert_eq!(out.candidates[1].country, None);
    }

    #[test]
    fn deduplicates_names_within_one_fetch() {
        let out = parse(
            "<table><tr><td>Acme Corp</td><td>SDN</td></tr>\
             <tr><td>Acme   Corp</td><td>SDGT</td></tr>\
             <tr><td></td><td>orphan</td></tr></table>",
        );
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].program.as_deref(), Some("SDN"));
        assert_eq!(out.skipped, 1);
    }

    #[test]
    fn ignores_scripts_comments_and_numeric_entities_decode() {
        let out = parse(
            "<script>var x = '<tr><td>Fake</td></tr>';</script>\
             <!-- <tr><td>Hidden</td></tr> -->\
             <table><tr><td>Caf&#233; &#x41;G</td></tr></table>",
        );
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].name, "Café AG");
    }

    #[test]
    fn record_cap_bounds_the_output() {
        let mut html = String::from("<table>");
        for i in 0..10 {
            html.push_str(&format!("<tr><td>Entity {i}</td></tr>"));
        }
        let out = HtmlTableParser::new("BIS")
            .with_max_records(3)
            .parse(html.as_bytes())
            .unwrap();
        assert_eq!(out.candidates.len(), 3);
    }
}
