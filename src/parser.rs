use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use log::debug;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use crate::error::DownloaderError;
use crate::types::{ReportPeriod, TaskMeta};

/// Body of the report-listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportListing {
    #[serde(default)]
    pub period: Option<ListingPeriod>,
    pub history: Vec<ListingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingPeriod {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingEntry {
    pub timestamp: String,
    pub report: BTreeMap<String, Option<String>>,
}

pub fn parse_listing(contents: &str) -> Result<ReportListing, DownloaderError> {
    let listing: ReportListing = serde_json::from_str(contents)?;
    debug!("Parsed listing with {} entries", listing.history.len());
    Ok(listing)
}

/// Reads a listing from `path`, or from stdin when `path` is `-`.
pub async fn read_listing(path: &Path) -> Result<ReportListing, DownloaderError> {
    let mut contents = String::new();
    if path == Path::new("-") {
        tokio::io::stdin().read_to_string(&mut contents).await?;
    } else {
        let mut file = tokio::fs::File::open(path).await?;
        file.read_to_string(&mut contents).await?;
    }
    parse_listing(&contents)
}

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Accepts the timestamp shapes the listing API has been seen to emit.
pub fn parse_date(date: &str) -> Result<NaiveDateTime, DownloaderError> {
    let date = date.trim();
    for format in DATE_TIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(date, format) {
            return Ok(parsed);
        }
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| DownloaderError::InvalidDate(date.to_string()))
}

pub fn report_id(timestamp: NaiveDateTime) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Buckets the timestamp into one of four 6-hour periods of its day.
pub fn report_period(timestamp: NaiveDateTime) -> ReportPeriod {
    let number = (timestamp.hour() / 6 + 1) as u8;
    let label = format!(
        "{}-{}-{} Report:{} [{}Z]",
        timestamp.year(),
        timestamp.month(),
        timestamp.day(),
        number,
        timestamp.format("%Y-%m-%dT%H:%M:%S")
    );
    ReportPeriod { label, number }
}

/// Extracts partition metadata from a pre-signed URL and derives the relative
/// destination path. Partition values missing from the URL come from the
/// report timestamp.
pub fn parse_task_meta(
    kind: &str,
    url: &str,
    timestamp: NaiveDateTime,
) -> Result<TaskMeta, DownloaderError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| DownloaderError::InvalidReport(format!("{}: {}", kind, e)))?;

    let mut meta = TaskMeta {
        report_type: Some(kind.to_string()),
        ..TaskMeta::default()
    };

    let segments: Vec<&str> = parsed.path().split('/').collect();
    for segment in &segments {
        let decoded = segment.replace("%3D", "=").replace("%3d", "=");
        let Some((key, value)) = decoded.split_once('=') else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let value = if key == "tenant" || value.chars().count() <= 4 {
            value.to_string()
        } else {
            let skip = value.chars().count() - 2;
            value.chars().skip(skip).collect()
        };
        match key {
            "year" => meta.year = Some(value),
            "month" => meta.month = Some(value),
            "day" => meta.day = Some(value),
            "hour" => meta.hour = Some(value),
            "tenant" => meta.tenant = Some(value),
            _ => debug!("Ignoring URL segment {}", segment),
        }
    }

    let file_name = segments
        .last()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DownloaderError::InvalidReport(format!("{}: URL has no file name", kind)))?;

    meta.path = format!(
        "{}/{}/{}/{}/{}",
        meta.year
            .clone()
            .unwrap_or_else(|| format!("{:04}", timestamp.year())),
        meta.month
            .clone()
            .unwrap_or_else(|| format!("{:02}", timestamp.month())),
        meta.day
            .clone()
            .unwrap_or_else(|| format!("{:02}", timestamp.day())),
        meta.hour
            .clone()
            .unwrap_or_else(|| format!("{:02}", timestamp.hour())),
        file_name
    );
    Ok(meta)
}

/// Parses `60m`, `16h`, `2d`, `1w`, a bare number of seconds, or one of
/// `hourly`, `daily`, `weekly`.
pub fn parse_interval(interval: &str) -> Result<chrono::Duration, DownloaderError> {
    let interval = interval.trim();
    let invalid = || DownloaderError::InvalidInterval(interval.to_string());

    if !interval.is_empty() && interval.chars().all(|c| c.is_ascii_digit()) {
        let seconds: i64 = interval.parse().map_err(|_| invalid())?;
        return chrono::Duration::try_seconds(seconds).ok_or_else(invalid);
    }

    match interval {
        "hourly" => return Ok(chrono::Duration::hours(1)),
        "daily" => return Ok(chrono::Duration::days(1)),
        "weekly" => return Ok(chrono::Duration::weeks(1)),
        _ => {}
    }

    let unit = interval.chars().last().ok_or_else(invalid)?;
    let value = &interval[..interval.len() - unit.len_utf8()];
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: i64 = value.parse().map_err(|_| invalid())?;
    let duration = match unit {
        'm' => chrono::Duration::try_minutes(value),
        'h' => chrono::Duration::try_hours(value),
        'd' => chrono::Duration::try_days(value),
        'w' => chrono::Duration::try_weeks(value),
        _ => None,
    };
    duration.ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        parse_date(s).unwrap()
    }

    #[test]
    fn parses_supported_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2017, 11, 20)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap();
        assert_eq!(ts("2017-11-20T06:00:00Z"), expected);
        assert_eq!(ts("2017-11-20T06:00:00.000Z"), expected);
        assert_eq!(ts("2017-11-20 06:00:00"), expected);
        assert_eq!(ts("2017-11-20T06:00:00"), expected);
        assert_eq!(ts("2017-11-20").hour(), 0);
        assert!(matches!(
            parse_date("20/11/2017"),
            Err(DownloaderError::InvalidDate(_))
        ));
    }

    #[test]
    fn buckets_reports_into_six_hour_periods() {
        assert_eq!(report_period(ts("2017-11-20T00:00:00Z")).number, 1);
        assert_eq!(report_period(ts("2017-11-20T05:59:59Z")).number, 1);
        assert_eq!(report_period(ts("2017-11-20T06:00:00Z")).number, 2);
        assert_eq!(report_period(ts("2017-11-20T12:30:00Z")).number, 3);
        let last = report_period(ts("2017-11-20T23:00:00Z"));
        assert_eq!(last.number, 4);
        assert_eq!(last.label, "2017-11-20 Report:4 [2017-11-20T23:00:00Z]");
    }

    #[test]
    fn extracts_partition_metadata_from_url() {
        let url = concat!(
            "https://bucket.s3.amazonaws.com/exports/tenant%3Dadrtgw45-0b09",
            "/year%3D2017/month%3D11/day%3D20/hour%3D2017112006/interfaces.csv",
            "?X-Amz-Signature=abc"
        );
        let meta = parse_task_meta("interfaces", url, ts("2017-11-20T06:00:00Z")).unwrap();
        assert_eq!(meta.tenant.as_deref(), Some("adrtgw45-0b09"));
        assert_eq!(meta.year.as_deref(), Some("2017"));
        assert_eq!(meta.hour.as_deref(), Some("06"));
        assert_eq!(meta.report_type.as_deref(), Some("interfaces"));
        assert_eq!(meta.path, "2017/11/20/06/interfaces.csv");
    }

    #[test]
    fn destination_ignores_signature() {
        let base = "https://host/r/year%3D2018/month%3D01/day%3D02/hour%3D12/radio.csv";
        let at = ts("2018-01-02T12:00:00Z");
        let a = parse_task_meta("radio", &format!("{}?sig=1", base), at).unwrap();
        let b = parse_task_meta("radio", &format!("{}?sig=2", base), at).unwrap();
        assert_eq!(a.path, b.path);
    }

    #[test]
    fn falls_back_to_timestamp_for_missing_partitions() {
        let at = ts("2016-02-17T06:00:00");
        let meta = parse_task_meta("a", "https://host/path/to/gateway-b.csv", at).unwrap();
        assert_eq!(meta.path, "2016/02/17/06/gateway-b.csv");
        assert!(parse_task_meta("a", "https://host/path/", at).is_err());
        assert!(parse_task_meta("a", "not a url", at).is_err());
    }

    #[test]
    fn parses_retention_intervals() {
        assert_eq!(parse_interval("16h").unwrap(), chrono::Duration::hours(16));
        assert_eq!(parse_interval("2d").unwrap(), chrono::Duration::days(2));
        assert_eq!(parse_interval("1w").unwrap(), chrono::Duration::weeks(1));
        assert_eq!(parse_interval("90m").unwrap(), chrono::Duration::minutes(90));
        assert_eq!(parse_interval("3600").unwrap(), chrono::Duration::hours(1));
        assert_eq!(parse_interval("daily").unwrap(), chrono::Duration::days(1));
        assert_eq!(parse_interval("weekly").unwrap(), chrono::Duration::weeks(1));
        assert_eq!(parse_interval("hourly").unwrap(), chrono::Duration::hours(1));
        for bad in [
            "",
            "2x",
            "h",
            "monthly",
            "1.5d",
            "9999999999999999d",
            "99999999999999999",
            "99999999999999999999w",
        ] {
            assert!(
                matches!(parse_interval(bad), Err(DownloaderError::InvalidInterval(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn parses_listing_payload() {
        let listing = parse_listing(
            r#"{
              "period": {"start": "2016-02-16T09:32:18Z", "end": "2016-02-17T09:32:18Z"},
              "history": [
                {"timestamp": "2016-02-17T00:00:00", "report": {"a": "https://h/a.csv", "b": null}}
              ]
            }"#,
        )
        .unwrap();
        assert_eq!(listing.history.len(), 1);
        assert_eq!(listing.period.unwrap().start, "2016-02-16T09:32:18Z");
        assert_eq!(listing.history[0].report["b"], None);
        assert!(parse_listing("{\"period\": {}}").is_err());
    }
}
