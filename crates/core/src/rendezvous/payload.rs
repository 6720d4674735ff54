//! Schema of the source's data API responses, also used as artifact body.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One page of the data API, or a whole merged artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagePayload {
    #[serde(default = "default_status")]
    pub status_code: u16,
    /// `None` when the source answered `"data": null`.
    #[serde(default)]
    pub data: Option<Vec<PriceRow>>,
}

fn default_status() -> u16 {
    200
}

impl PagePayload {
    pub fn new(status_code: u16, rows: Vec<PriceRow>) -> Self {
        Self {
            status_code,
            data: Some(rows),
        }
    }

    pub fn rows(&self) -> &[PriceRow] {
        self.data.as_deref().unwrap_or_default()
    }
}

/// A daily row. Fields other than the timestamp and close are carried along
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    /// RFC 3339 timestamp, e.g. `2024-01-02T00:00:00Z`.
    #[serde(rename = "rowDateTimestamp")]
    pub row_date_timestamp: String,
    #[serde(deserialize_with = "number_or_string")]
    pub last_close: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PriceRow {
    pub fn new(row_date_timestamp: impl Into<String>, last_close: f64) -> Self {
        Self {
            row_date_timestamp: row_date_timestamp.into(),
            last_close,
            extra: Map::new(),
        }
    }

    /// Calendar date of the row: the part of the timestamp before `T`.
    pub fn date(&self) -> Option<NaiveDate> {
        let day = self
            .row_date_timestamp
            .split('T')
            .next()
            .unwrap_or_default()
            .trim();
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s
            .trim()
            .replace(',', "")
            .parse::<f64>()
            .map_err(|e| serde::de::Error::custom(format!("last_close '{}': {}", s, e))),
    }
}

/// Order rows ascending by timestamp, keeping the last occurrence of each
/// timestamp.
pub fn normalize_rows(rows: impl IntoIterator<Item = PriceRow>) -> Vec<PriceRow> {
    let mut by_timestamp: BTreeMap<String, PriceRow> = BTreeMap::new();
    for row in rows {
        by_timestamp.insert(row.row_date_timestamp.clone(), row);
    }
    by_timestamp.into_values().collect()
}

/// Latest row date in a page.
pub fn latest_date(rows: &[PriceRow]) -> Option<NaiveDate> {
    rows.iter().filter_map(PriceRow::date).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_page_with_extra_fields() {
        let body = json!({
            "status_code": 200,
            "data": [
                {"rowDateTimestamp": "2024-01-03T00:00:00Z", "last_close": 2.61, "volume": "0"},
                {"rowDateTimestamp": "2024-01-02T00:00:00Z", "last_close": "2.58"}
            ]
        })
        .to_string();

        let page: PagePayload = serde_json::from_str(&body).unwrap();
        assert_eq!(page.rows().len(), 2);
        assert_eq!(page.rows()[0].last_close, 2.61);
        assert_eq!(page.rows()[1].last_close, 2.58);
        assert_eq!(page.rows()[0].extra["volume"], "0");

        let encoded = serde_json::to_value(&page).unwrap();
        assert_eq!(encoded["data"][0]["volume"], "0");
        assert_eq!(encoded["data"][0]["rowDateTimestamp"], "2024-01-03T00:00:00Z");
    }

    #[test]
    fn test_null_data() {
        let page: PagePayload = serde_json::from_str(r#"{"status_code": 200, "data": null}"#).unwrap();
        assert!(page.data.is_none());
        assert!(page.rows().is_empty());
    }

    #[test]
    fn test_bad_close_is_rejected() {
        let result: Result<PagePayload, _> = serde_json::from_str(
            r#"{"data": [{"rowDateTimestamp": "2024-01-02T00:00:00Z", "last_close": "n/a"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_row_date() {
        let row = PriceRow::new("2024-02-29T00:00:00Z", 1.0);
        assert_eq!(row.date(), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(PriceRow::new("garbage", 1.0).date(), None);
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let rows = vec![
            PriceRow::new("2024-01-03T00:00:00Z", 3.0),
            PriceRow::new("2024-01-01T00:00:00Z", 1.0),
            PriceRow::new("2024-01-03T00:00:00Z", 3.5),
            PriceRow::new("2024-01-02T00:00:00Z", 2.0),
        ];
        let normalized = normalize_rows(rows);
        let closes: Vec<f64> = normalized.iter().map(|r| r.last_close).collect();
        assert_eq!(closes, vec![1.0, 2.0, 3.5]);
        assert_eq!(
            latest_date(&normalized),
            NaiveDate::from_ymd_opt(2024, 1, 3)
        );
    }
}
