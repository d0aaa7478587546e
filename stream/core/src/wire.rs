//! Backend Wire Types
//!
//! The response envelope every JSON endpoint of the backend uses, plus a
//! lenient timestamp codec: the backend emits both zoned instants
//! (`2024-05-01T10:00:00Z`) and zone-less local date-times
//! (`2024-05-01T10:00:00.123`), which are read as UTC.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// `{success, message?, data, error?}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    #[must_use]
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            error: None,
        }
    }

    /// Payload of a successful response
    pub fn into_data(self) -> anyhow::Result<T> {
        if !self.success {
            let reason = self
                .error
                .or(self.message)
                .unwrap_or_else(|| "request failed".to_string());
            return Err(anyhow!("backend reported failure: {reason}"));
        }
        self.data
            .ok_or_else(|| anyhow!("backend response carried no data"))
    }
}

pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Millis(i64),
    }

    fn parse(raw: Raw) -> Option<DateTime<Utc>> {
        match raw {
            Raw::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                }),
        }
    }

    /// Optional timestamp; unparseable values read as `None`
    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Raw>::deserialize(deserializer)?;
        Ok(raw.and_then(parse))
    }
}
