use super::{ParseOutcome, Parser};
use crate::error::Result;

/// Presence-only source (e.g. a PDF publication).
///
/// Nothing is extracted; the payload only takes part in checksum change detection so
/// that a republished document still shows up in the change log.
pub struct OpaqueParser;

impl Parser for OpaqueParser {
    fn parse(&self, _content: &[u8]) -> Result<ParseOutcome> {
        Ok(ParseOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_no_candidates() {
        let out = OpaqueParser.parse(b"%PDF-1.7\n%\xE2\xE3\xCF\xD3 name,program").unwrap();
        assert!(out.candidates.is_empty());
        assert_eq!(out.skipped, 0);
    }
}
