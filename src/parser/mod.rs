//! Source-specific extractors behind one contract.
//!
//! Every source is read by exactly one [`ParserKind`], chosen from configuration.
//! Adding a publisher with a new format means adding a variant here, not teaching
//! existing parsers to sniff content.

pub mod delimited;
pub mod html_table;
pub mod opaque;

use crate::error::Result;
use crate::types::{CandidateEntity, ContentKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub use delimited::DelimitedParser;
pub use html_table::HtmlTableParser;
pub use opaque::OpaqueParser;

/// Output of a single parse: usable candidates plus a count of rows that were dropped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub candidates: Vec<CandidateEntity>,
    pub skipped: usize,
}

pub trait Parser: Send + Sync {
    fn parse(&self, content: &[u8]) -> Result<ParseOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Delimited,
    HtmlTable,
    Opaque,
}

impl ParserKind {
    /// Kind of content the fetcher should report for this parser
    pub fn content_kind(&self) -> ContentKind {
        match self {
            ParserKind::Delimited => ContentKind::Text,
            ParserKind::HtmlTable => ContentKind::Html,
            ParserKind::Opaque => ContentKind::Binary,
        }
    }
}

/// Build the parser for a configured source
pub fn parser_for(kind: ParserKind, source_id: &str, delimiter: u8) -> Box<dyn Parser> {
    match kind {
        ParserKind::Delimited => Box::new(DelimitedParser::new(source_id, delimiter)),
        ParserKind::HtmlTable => Box::new(HtmlTableParser::new(source_id)),
        ParserKind::Opaque => Box::new(OpaqueParser),
    }
}

const NAME_COLUMNS: &[&str] = &["name", "sdn_name", "entity", "entity_name", "full_name"];
const PROGRAM_COLUMNS: &[&str] = &["program", "programs", "sanctions_program", "list"];
const COUNTRY_COLUMNS: &[&str] = &["country", "countries", "nationality"];
const ALIAS_COLUMNS: &[&str] = &["aliases", "alias", "aka"];

/// Header-derived column positions shared by the tabular parsers
#[derive(Debug, Clone)]
pub(crate) struct ColumnMap {
    pub name: usize,
    pub program: Option<usize>,
    pub country: Option<usize>,
    pub aliases: Option<usize>,
    /// Remaining columns, kept as identifiers
    pub extra: Vec<(usize, String)>,
    pub width: usize,
}

impl ColumnMap {
    /// Map header cells case-insensitively. Returns `None` when no name column is present.
    pub fn from_header(header: &[String]) -> Option<Self> {
        let index: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(i, h)| (normalize_header(h), i))
            .collect();
        let find = |names: &[&str]| names.iter().find_map(|n| index.get(*n).copied());

        let name = find(NAME_COLUMNS)?;
        let program = find(PROGRAM_COLUMNS);
        let country = find(COUNTRY_COLUMNS);
        let aliases = find(ALIAS_COLUMNS);
        let mapped = [Some(name), program, country, aliases];
        let extra = header
            .iter()
            .enumerate()
            .filter(|(i, h)| !mapped.contains(&Some(*i)) && !h.trim().is_empty())
            .map(|(i, h)| (i, normalize_header(h)))
            .collect();

        Some(Self {
            name,
            program,
            country,
            aliases,
            extra,
            width: header.len(),
        })
    }

    /// Positional layout used when a table has no header row: name, program, country.
    pub fn positional(width: usize) -> Self {
        Self {
            name: 0,
            program: (width > 1).then_some(1),
            country: (width > 2).then_some(2),
            aliases: None,
            extra: Vec::new(),
            width,
        }
    }

    /// Build a candidate from one row. Returns `None` when the name cell is empty.
    pub fn candidate(&self, row: &[String]) -> Option<CandidateEntity> {
        let cell = |i: Option<usize>| {
            i.and_then(|i| row.get(i))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let name = cell(Some(self.name))?;
        let aliases = cell(self.aliases)
            .map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let identifiers: BTreeMap<String, String> = self
            .extra
            .iter()
            .filter_map(|(i, key)| cell(Some(*i)).map(|v| (key.clone(), v)))
            .collect();

        Some(CandidateEntity {
            name,
            program: cell(self.program),
            country: cell(self.country),
            aliases,
            identifiers,
        })
    }
}

fn normalize_header(h: &str) -> String {
    h.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}
