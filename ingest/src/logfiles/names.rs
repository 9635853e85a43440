//! File name conventions of the staged and fallback logs.
//!
//! Staged batch files encode `{table}-{token}-{rows}-{rfc3339}.ndjson`; the
//! batch worker recovers accounting from the name after a crash. Fallback
//! files encode `failed.dst={destination}-{rfc3339}.log`; replay recovers
//! the destination id from the name. A name that doesn't parse is a
//! terminal error for that file.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::bail;
use crate::error::{ErrorKind, IngestResult};

/// Prefix of every fallback log file.
pub const FALLBACK_PREFIX: &str = "failed.dst=";

/// Extension of staged batch files.
pub const STAGED_EXTENSION: &str = "ndjson";

/// Parsed form of a staged batch file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFileName {
    pub table: String,
    pub token_id: String,
    pub rows: usize,
    pub date: DateTime<Utc>,
}

impl StagedFileName {
    /// Renders the canonical staged file name.
    pub fn render(&self) -> String {
        format!(
            "{}-{}-{}-{}.{STAGED_EXTENSION}",
            self.table,
            self.token_id,
            self.rows,
            // Colons are not filesystem-safe everywhere; the timestamp keeps
            // RFC 3339 shape with dashes in the time part.
            file_timestamp(self.date),
        )
    }

    /// Parses `{table}-{token}-{rows}-{rfc3339}.ndjson`.
    ///
    /// The table name may itself contain dashes, so the name is parsed from
    /// the right: timestamp, then rows, then token.
    pub fn parse(file_name: &str) -> IngestResult<Self> {
        let Some(stem) = file_name.strip_suffix(&format!(".{STAGED_EXTENSION}")) else {
            bail!(
                ErrorKind::MalformedFileName,
                "Staged file has no .ndjson extension",
                file_name
            );
        };

        // The timestamp occupies a fixed-width suffix.
        if stem.len() < TIMESTAMP_WIDTH + 1 {
            bail!(ErrorKind::MalformedFileName, "Staged file name too short", file_name);
        }
        let (rest, raw_date) = stem.split_at(stem.len() - TIMESTAMP_WIDTH);
        let Some(rest) = rest.strip_suffix('-') else {
            bail!(ErrorKind::MalformedFileName, "Malformed staged file name", file_name);
        };

        let date = parse_file_timestamp(raw_date).ok_or_else(|| {
            crate::ingest_error!(
                ErrorKind::MalformedFileName,
                "Staged file timestamp does not parse",
                file_name
            )
        })?;

        let Some((rest, raw_rows)) = rest.rsplit_once('-') else {
            bail!(ErrorKind::MalformedFileName, "Malformed staged file name", file_name);
        };
        let Ok(rows) = raw_rows.parse::<usize>() else {
            bail!(
                ErrorKind::MalformedFileName,
                "Staged file rows count does not parse",
                file_name
            );
        };

        let Some((table, token_id)) = rest.rsplit_once('-') else {
            bail!(ErrorKind::MalformedFileName, "Malformed staged file name", file_name);
        };
        if table.is_empty() || token_id.is_empty() {
            bail!(ErrorKind::MalformedFileName, "Malformed staged file name", file_name);
        }

        Ok(StagedFileName {
            table: table.to_owned(),
            token_id: token_id.to_owned(),
            rows,
            date,
        })
    }
}

/// Parsed form of a fallback log file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileName {
    pub destination_id: String,
    pub date: DateTime<Utc>,
}

impl FallbackFileName {
    pub fn render(&self) -> String {
        format!(
            "{FALLBACK_PREFIX}{}-{}.log",
            self.destination_id,
            file_timestamp(self.date)
        )
    }

    /// Parses `failed.dst={destination}-{rfc3339}.log`, recovering the
    /// destination id the way replay does when it is not passed explicitly.
    pub fn parse(file_name: &str) -> IngestResult<Self> {
        let Some(stem) = file_name
            .strip_prefix(FALLBACK_PREFIX)
            .and_then(|rest| rest.strip_suffix(".log"))
        else {
            bail!(
                ErrorKind::MalformedFileName,
                "Not a fallback log file name",
                file_name
            );
        };

        if stem.len() < TIMESTAMP_WIDTH + 1 {
            bail!(ErrorKind::MalformedFileName, "Fallback file name too short", file_name);
        }
        let (rest, raw_date) = stem.split_at(stem.len() - TIMESTAMP_WIDTH);
        let Some(destination_id) = rest.strip_suffix('-') else {
            bail!(ErrorKind::MalformedFileName, "Malformed fallback file name", file_name);
        };

        let date = parse_file_timestamp(raw_date).ok_or_else(|| {
            crate::ingest_error!(
                ErrorKind::MalformedFileName,
                "Fallback file timestamp does not parse",
                file_name
            )
        })?;

        if destination_id.is_empty() {
            bail!(ErrorKind::MalformedFileName, "Malformed fallback file name", file_name);
        }

        Ok(FallbackFileName {
            destination_id: destination_id.to_owned(),
            date,
        })
    }
}

/// Width of `2006-01-02T15-04-05Z`.
const TIMESTAMP_WIDTH: usize = 20;

/// RFC 3339 second precision with `-` instead of `:` in the time part.
pub fn file_timestamp(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace(':', "-")
}

fn parse_file_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() != TIMESTAMP_WIDTH {
        return None;
    }
    // Restore the colons dropped by `file_timestamp`.
    let mut restored: Vec<u8> = raw.bytes().collect();
    restored[13] = b':';
    restored[16] = b':';
    let restored = String::from_utf8(restored).ok()?;
    DateTime::parse_from_rfc3339(&restored)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 1, 10, 30, 0).unwrap()
    }

    #[test]
    fn staged_name_round_trips() {
        let name = StagedFileName {
            table: "events".into(),
            token_id: "tok1".into(),
            rows: 420,
            date: date(),
        };
        let rendered = name.render();
        assert_eq!(rendered, "events-tok1-420-2023-04-01T10-30-00Z.ndjson");
        assert_eq!(StagedFileName::parse(&rendered).unwrap(), name);
    }

    #[test]
    fn staged_table_names_may_contain_dashes() {
        let name = StagedFileName {
            table: "events-page-view".into(),
            token_id: "tok1".into(),
            rows: 1,
            date: date(),
        };
        assert_eq!(StagedFileName::parse(&name.render()).unwrap(), name);
    }

    #[test]
    fn malformed_staged_names_are_terminal() {
        for bad in [
            "events.ndjson",
            "events-tok.ndjson",
            "events-tok-x-2023-04-01T10-30-00Z.ndjson",
            "events-tok-5-not-a-date.ndjson",
            "events-tok-5-2023-04-01T10-30-00Z.log",
        ] {
            let err = StagedFileName::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedFileName, "{bad}");
        }
    }

    #[test]
    fn fallback_name_round_trips() {
        let name = FallbackFileName {
            destination_id: "pg-main".into(),
            date: date(),
        };
        let rendered = name.render();
        assert_eq!(rendered, "failed.dst=pg-main-2023-04-01T10-30-00Z.log");
        assert_eq!(FallbackFileName::parse(&rendered).unwrap(), name);
    }

    #[test]
    fn fallback_parse_rejects_foreign_files() {
        assert!(FallbackFileName::parse("queue.dst=x-2023.log").is_err());
        assert!(FallbackFileName::parse("failed.dst=-2023-04-01T10-30-00Z.log").is_err());
    }
}
