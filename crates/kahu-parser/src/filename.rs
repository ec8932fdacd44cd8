//! Positional decode of the extract naming convention:
//! `<PerOrgID><PracticeID><ExtractType><DateFrom><DateTo><DateExtracted>.csv`
//!
//! Widths are fixed: per-org id 5, practice id 4, each date 12 chars of
//! `YYYYMMDDHHMM` in the ingestion time zone. The extract-type token sits
//! between the practice id and the first date and is matched by exact name.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::errors::FilenameError;
use crate::extract::{ExtractType, FullLoadRule};

const PER_ORG_WIDTH: usize = 5;
const PRACTICE_WIDTH: usize = 4;
const DATE_WIDTH: usize = 12;
const DATE_FORMAT: &str = "%Y%m%d%H%M";
const BATCH_ID_FORMAT: &str = "%y%m%d%H%M";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedFilename {
    pub per_org_id: String,
    pub practice_id: String,
    pub extract_type: ExtractType,
    /// Token exactly as it appeared in the name; may be a singular variant.
    pub type_token: String,
    pub date_from: NaiveDateTime,
    pub date_to: NaiveDateTime,
    pub date_extracted: NaiveDateTime,
    /// `date_extracted` formatted `YYMMDDHHMM`; equal across one delivery.
    pub batch_id: String,
    pub is_full_load: bool,
}

impl ParsedFilename {
    /// Rebuild the file name (without directory prefix). Parsing followed by
    /// formatting reproduces the original name byte for byte.
    pub fn format_name(&self) -> String {
        format!(
            "{}{}{}{}{}{}.csv",
            self.per_org_id,
            self.practice_id,
            self.type_token,
            self.date_from.format(DATE_FORMAT),
            self.date_to.format(DATE_FORMAT),
            self.date_extracted.format(DATE_FORMAT),
        )
    }

    /// The extraction instant resolved in the ingestion time zone. Ambiguous
    /// local times (the DST fold) resolve to the earlier instant.
    pub fn extracted_at(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.date_extracted
            .and_local_timezone(tz)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    }
}

/// Decode an object key into a `ParsedFilename`. Failure is recoverable:
/// callers log a warning and skip the object.
pub fn parse_object_key(key: &str, rule: FullLoadRule) -> Result<ParsedFilename, FilenameError> {
    let name = key.rsplit('/').next().unwrap_or(key);

    let stem = name
        .strip_suffix(".csv")
        .ok_or_else(|| FilenameError::NotCsv(key.to_string()))?;

    let min = PER_ORG_WIDTH + PRACTICE_WIDTH + 1 + 3 * DATE_WIDTH;
    if stem.len() < min || !stem.is_ascii() {
        return Err(FilenameError::TooShort {
            name: name.to_string(),
            len: stem.len(),
            min,
        });
    }

    let (ids, rest) = stem.split_at(PER_ORG_WIDTH + PRACTICE_WIDTH);
    let (per_org_id, practice_id) = ids.split_at(PER_ORG_WIDTH);
    let (token, dates) = rest.split_at(rest.len() - 3 * DATE_WIDTH);

    let extract_type = ExtractType::from_token(token).ok_or_else(|| {
        FilenameError::UnknownExtractType {
            name: name.to_string(),
            token: token.to_string(),
        }
    })?;

    let date_from = parse_date("date_from", &dates[..DATE_WIDTH])?;
    let date_to = parse_date("date_to", &dates[DATE_WIDTH..2 * DATE_WIDTH])?;
    let date_extracted = parse_date("date_extracted", &dates[2 * DATE_WIDTH..])?;

    if !(date_from <= date_to && date_to <= date_extracted) {
        return Err(FilenameError::DatesOutOfOrder {
            name: name.to_string(),
        });
    }

    let is_full_load = match rule {
        FullLoadRule::SnapshotWindow => date_from == date_to,
        FullLoadRule::Never => false,
    };

    Ok(ParsedFilename {
        per_org_id: per_org_id.to_string(),
        practice_id: practice_id.to_string(),
        extract_type,
        type_token: token.to_string(),
        date_from,
        date_to,
        date_extracted,
        batch_id: date_extracted.format(BATCH_ID_FORMAT).to_string(),
        is_full_load,
    })
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDateTime, FilenameError> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT).map_err(|_| FilenameError::InvalidDate {
        field,
        value: value.to_string(),
    })
}
