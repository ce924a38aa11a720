//! Database row types. Converted to/from `storage_traits` types at the
//! backend boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serializes chrono datetimes as native SurrealDB datetimes.
pub(crate) mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

pub(crate) mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in `runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub definition_digest: String,
    pub revision: Option<String>,
    pub pipeline_name: String,
    pub tags: serde_json::Value,
    /// "running" | "completed" | "failed"
    pub status: String,
    pub total_events: u64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn new(
        run_id: String,
        definition_digest: String,
        revision: Option<String>,
        pipeline_name: String,
        tags: serde_json::Value,
    ) -> Self {
        RunRow {
            id: None,
            run_id,
            definition_digest,
            revision,
            pipeline_name,
            tags,
            status: "running".to_string(),
            total_events: 0,
            duration_ms: 0,
            success: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Row in `run_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

/// Row in `pipeline_snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub pipeline: String,
    pub versions: BTreeMap<String, String>,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

/// Row in `published_versions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// "component" | "recipe"
    pub kind: String,
    pub name: String,
    pub version: String,
    pub digest: String,
    pub content: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub published_at: DateTime<Utc>,
}
