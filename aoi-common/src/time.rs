//! Timestamp utilities
//!
//! Storage folders are partitioned by local calendar date (`YYYYMMDD`) and
//! generated file names embed a local `YYYYMMDD_HHMMSS` timestamp.

use chrono::{DateTime, Local, NaiveDate};

/// Format of date-partitioned folder names
pub const DATE_FOLDER_FORMAT: &str = "%Y%m%d";

/// Format of timestamps embedded in generated file names
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Current local time; storage folders follow the host calendar
pub fn local_now() -> DateTime<Local> {
    Local::now()
}

/// Date folder name (`YYYYMMDD`) for the given instant
pub fn date_folder(at: &DateTime<Local>) -> String {
    at.format(DATE_FOLDER_FORMAT).to_string()
}

/// File-name timestamp (`YYYYMMDD_HHMMSS`) for the given instant
pub fn file_timestamp(at: &DateTime<Local>) -> String {
    at.format(FILE_TIMESTAMP_FORMAT).to_string()
}

/// Parse a date folder name; `None` when the name is not a `YYYYMMDD` date
pub fn parse_date_folder(name: &str) -> Option<NaiveDate> {
    if name.len() != 8 || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(name, DATE_FOLDER_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_folder_format() {
        let at = Local.with_ymd_and_hms(2026, 2, 25, 14, 30, 22).unwrap();
        assert_eq!(date_folder(&at), "20260225");
        assert_eq!(file_timestamp(&at), "20260225_143022");
    }

    #[test]
    fn test_parse_date_folder_accepts_dates() {
        assert_eq!(
            parse_date_folder("20260225"),
            NaiveDate::from_ymd_opt(2026, 2, 25)
        );
    }

    #[test]
    fn test_parse_date_folder_rejects_other_names() {
        assert_eq!(parse_date_folder("batch_20260225"), None);
        assert_eq!(parse_date_folder("20261340"), None);
        assert_eq!(parse_date_folder("2026022"), None);
        assert_eq!(parse_date_folder("+2026022"), None);
    }
}
