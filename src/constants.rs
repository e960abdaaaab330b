/// Source identifiers. These double as the `entity_key` namespace, so they must never change.
pub const OFAC_SOURCE: &str = "OFAC";
pub const BIS_SOURCE: &str = "BIS";
pub const EU_SOURCE: &str = "EU";

// Default publisher endpoints; every one of them can be overridden in the config file
pub const OFAC_DEFAULT_URL: &str = "https://www.treasury.gov/ofac/downloads/sdn.csv";
pub const BIS_DEFAULT_URL: &str =
    "https://www.bis.doc.gov/index.php/policy-guidance/lists-of-parties-of-concern/entity-list";
pub const EU_DEFAULT_URL: &str =
    "https://webgate.ec.europa.eu/fsd/fsf/public/files/pdfFullSanctionsList/content";

/// Upper bound on records a text parser will consider per fetch.
pub const MAX_RECORDS_PER_RUN: usize = 5000;

/// Snapshots keep at most this many bytes of the raw payload.
pub const MAX_SNAPSHOT_BYTES: usize = 256 * 1024;

/// Response bodies attached to non-success status errors are cut to this length.
pub const MAX_ERROR_BODY_BYTES: usize = 512;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DB_PATH: &str = "data/sanctions_watch.db";
pub const DEFAULT_CONFIG_PATH: &str = "sanctions_watch.toml";

pub const TRIGGER_TOKEN_HEADER: &str = "x-ingest-token";

/// Cut `s` to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
