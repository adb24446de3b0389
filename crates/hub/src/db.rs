use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::model::{Origin, ScheduleEntry};

/// Keys of the durable documents in `engine_state`.
pub const ZONES_KEY: &str = "zones";
pub const SCHEDULES_KEY: &str = "schedules";
pub const SETTINGS_KEY: &str = "settings";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A finished (completed or cancelled) schedule entry, as stored.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WateringEvent {
    pub id: i64,
    pub schedule_id: String,
    pub zone_id: String,
    pub zone_name: String,
    pub origin: String,
    pub ts_start: Option<i64>,
    pub ts_end: i64,
    pub duration_min: i64,
    pub water_liters: f64,
    pub reason: String,
    pub result: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite:irrigation.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Engine state documents
    // ----------------------------

    pub async fn put_state<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        now: OffsetDateTime,
    ) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("serialising state '{key}'"))?;
        sqlx::query(
            r#"
            INSERT INTO engine_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(json)
        .bind(now.unix_timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("put_state '{key}' failed"))?;
        Ok(())
    }

    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM engine_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get_state '{key}' failed"))?;

        row.map(|(json,)| {
            serde_json::from_str(&json).with_context(|| format!("decoding stored state '{key}'"))
        })
        .transpose()
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn insert_watering_event(&self, entry: &ScheduleEntry) -> Result<()> {
        let origin = match entry.origin {
            Origin::Auto => "auto",
            Origin::Manual => "manual",
        };
        let ts_end = entry.completed_at.unwrap_or(entry.scheduled_time);
        sqlx::query(
            r#"
            INSERT INTO watering_events (
              schedule_id, zone_id, zone_name, origin,
              ts_start, ts_end, duration_min, water_liters,
              reason, result
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.zone_id)
        .bind(&entry.zone_name)
        .bind(origin)
        .bind(entry.started_at.map(|t| t.unix_timestamp()))
        .bind(ts_end.unix_timestamp())
        .bind(i64::from(entry.duration_min))
        .bind(entry.water_amount_liters)
        .bind(&entry.reason)
        .bind(entry.status.to_string())
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_watering_events(&self, limit: i64) -> Result<Vec<WateringEvent>> {
        sqlx::query_as::<_, WateringEvent>(
            r#"
            SELECT id, schedule_id, zone_id, zone_name, origin,
                   ts_start, ts_end, duration_min, water_liters,
                   reason, result
            FROM watering_events
            ORDER BY ts_end DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_watering_events failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScheduleStatus, Settings};
    use time::macros::datetime;

    async fn db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn finished(id: &str, status: ScheduleStatus, end: OffsetDateTime) -> ScheduleEntry {
        ScheduleEntry {
            id: id.into(),
            zone_id: "z1".into(),
            zone_name: "North".into(),
            scheduled_time: end,
            duration_min: 25,
            status,
            reason: "Soil moisture low".into(),
            water_amount_liters: 50.0,
            origin: Origin::Manual,
            urgency: None,
            created_at: end,
            started_at: (status == ScheduleStatus::Completed).then_some(end),
            completed_at: Some(end),
        }
    }

    // -- engine_state -------------------------------------------------------

    #[tokio::test]
    async fn missing_state_is_none() {
        let db = db().await;
        let got: Option<Settings> = db.get_state(SETTINGS_KEY).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn put_state_overwrites() {
        let db = db().await;
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut s = Settings::default();
        db.put_state(SETTINGS_KEY, &s, now).await.unwrap();
        s.moisture_threshold = 55.0;
        db.put_state(SETTINGS_KEY, &s, now).await.unwrap();

        let got: Settings = db.get_state(SETTINGS_KEY).await.unwrap().unwrap();
        assert_eq!(got, s);
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let db = db().await;
        db.put_state(SETTINGS_KEY, "not settings", datetime!(2024-06-01 12:00 UTC))
            .await
            .unwrap();
        assert!(db.get_state::<Settings>(SETTINGS_KEY).await.is_err());
    }

    // -- watering_events ----------------------------------------------------

    #[tokio::test]
    async fn watering_events_newest_first_with_limit() {
        let db = db().await;
        let t = datetime!(2024-06-01 12:00 UTC);
        db.insert_watering_event(&finished("a", ScheduleStatus::Completed, t))
            .await
            .unwrap();
        db.insert_watering_event(&finished("b", ScheduleStatus::Cancelled, t + time::Duration::hours(1)))
            .await
            .unwrap();
        db.insert_watering_event(&finished("c", ScheduleStatus::Completed, t + time::Duration::hours(2)))
            .await
            .unwrap();

        let events = db.recent_watering_events(2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].schedule_id, "c");
        assert_eq!(events[1].schedule_id, "b");
        assert_eq!(events[1].result, "cancelled");
        assert_eq!(events[1].ts_start, None);
        assert_eq!(events[0].origin, "manual");
        assert_eq!(events[0].duration_min, 25);
    }
}
