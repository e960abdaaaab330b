use super::{ColumnMap, ParseOutcome, Parser};
use crate::constants::MAX_RECORDS_PER_RUN;
use crate::error::{Result, WatchError};
use tracing::{debug, warn};

/// Delimited-text extractor built on the `csv` reader.
///
/// Quoted fields may contain the delimiter, line breaks, and doubled quotes (`""`).
/// The first non-blank record is the header; rows whose width differs from it are dropped.
pub struct DelimitedParser {
    source_id: String,
    delimiter: u8,
    max_records: usize,
}

impl DelimitedParser {
    pub fn new(source_id: &str, delimiter: u8) -> Self {
        Self {
            source_id: source_id.to_string(),
            delimiter,
            max_records: MAX_RECORDS_PER_RUN,
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }
}

impl Parser for DelimitedParser {
    fn parse(&self, content: &[u8]) -> Result<ParseOutcome> {
        let text = String::from_utf8_lossy(content);
        // Width is checked per row below, so the reader itself accepts ragged records
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut outcome = ParseOutcome::default();
        let mut columns: Option<ColumnMap> = None;
        let mut considered = 0usize;

        for result in reader.records() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    debug!(source = %self.source_id, error = %e, "unreadable delimited record");
                    outcome.skipped += 1;
                    continue;
                }
            };
            if record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            let fields: Vec<String> = record.iter().map(str::to_string).collect();

            let Some(map) = columns.as_ref() else {
                let map = ColumnMap::from_header(&fields).ok_or_else(|| WatchError::Parse {
                    source_id: self.source_id.clone(),
                    message: format!("header has no name column: {:?}", fields),
                })?;
                columns = Some(map);
                continue;
            };

            if considered == self.max_records {
                warn!(
                    source = %self.source_id,
                    max_records = self.max_records,
                    "record cap reached, ignoring the rest of the payload"
                );
                break;
            }
            considered += 1;

            if fields.len() != map.width {
                outcome.skipped += 1;
                continue;
            }
            match map.candidate(&fields) {
                Some(candidate) => outcome.candidates.push(candidate),
                None => outcome.skipped += 1,
            }
        }

        if columns.is_none() {
            debug!(source = %self.source_id, "empty delimited payload");
        }
        debug!(
            source = %self.source_id,
            candidates = outcome.candidates.len(),
            skipped = outcome.skipped,
            "parsed delimited payload"
        );
        Ok(outcome)
    }
}
