use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use tokio::fs;

use crate::{
    remote::{parse_remote_name, DEFAULT_REMOTE},
    MonounitError, MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the unit registry database
pub static REGISTRY_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/management/migrations/registry");

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The persisted record of every unit deployed through monounit, keyed by name.
#[derive(Debug, Clone)]
pub struct Registry {
    pool: Pool<Sqlite>,
}

/// A registry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    /// Row id.
    pub id: i64,

    /// Unique identifier generated at registration.
    pub uid: String,

    /// Unit name. Lookups ignore case.
    pub name: String,

    /// RFC 3339 registration time.
    pub date: String,

    /// What the unit was deployed with.
    pub data: UnitMetadata,
}

/// Deployment parameters captured from the service spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMetadata {
    /// Static IPv4 address, empty when none was requested.
    #[serde(default)]
    pub ip: String,

    /// Image the unit was launched from.
    pub image: String,

    /// CPU limit.
    pub cpu: u32,

    /// Memory limit.
    pub ram: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Registry {
    /// Opens the registry at `db_path`, creating and migrating it if needed.
    pub async fn open(db_path: impl AsRef<Path>) -> MonounitResult<Self> {
        let db_path = db_path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await?;

        REGISTRY_DB_MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Records a freshly deployed unit under a new unique id.
    pub async fn insert(&self, name: &str, data: &UnitMetadata) -> MonounitResult<UnitRecord> {
        let uid = uuid::Uuid::new_v4().to_string();
        let date = Utc::now().to_rfc3339();
        let blob = serde_json::to_string(data)?;

        let row = sqlx::query(
            r#"
            INSERT INTO units (uid, name, date, data)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&uid)
        .bind(name)
        .bind(&date)
        .bind(&blob)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                MonounitError::Conflict(format!("unit {name} is already registered"))
            }
            e => e.into(),
        })?;

        tracing::debug!("registered unit {name} as {uid}");
        Ok(UnitRecord {
            id: row.get("id"),
            uid,
            name: name.to_string(),
            date,
            data: data.clone(),
        })
    }

    /// Looks a unit up by name, ignoring case.
    pub async fn get_by_name(&self, name: &str) -> MonounitResult<UnitRecord> {
        let row = sqlx::query("SELECT id, uid, name, date, data FROM units WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MonounitError::NotFound(format!("unit {name} in registry")))?;

        record_from_row(&row)
    }

    /// Deletes a unit's record. Fails with `NotFound` when nothing matched.
    pub async fn delete_by_name(&self, name: &str) -> MonounitResult<()> {
        let result = sqlx::query("DELETE FROM units WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MonounitError::NotFound(format!("unit {name} in registry")));
        }
        Ok(())
    }

    /// Every record, ordered by name.
    pub async fn list(&self) -> MonounitResult<Vec<UnitRecord>> {
        let rows = sqlx::query("SELECT id, uid, name, date, data FROM units ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Drops the records of units that no longer exist on the backend.
    ///
    /// `live` holds the names the default remote currently reports. Records of units on other
    /// remotes (`remote:name`) are left alone. Returns the names removed.
    pub async fn reconcile(&self, live: &[String]) -> MonounitResult<Vec<String>> {
        let live: Vec<String> = live.iter().map(|n| n.to_lowercase()).collect();
        let mut removed = Vec::new();

        for record in self.list().await? {
            let (remote, _) = parse_remote_name(&record.name);
            if remote != DEFAULT_REMOTE {
                continue;
            }
            if !live.contains(&record.name.to_lowercase()) {
                self.delete_by_name(&record.name).await?;
                tracing::info!("pruned registry record of vanished unit {}", record.name);
                removed.push(record.name);
            }
        }

        Ok(removed)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> MonounitResult<UnitRecord> {
    let data: String = row.get("data");
    Ok(UnitRecord {
        id: row.get("id"),
        uid: row.get("uid"),
        name: row.get("name"),
        date: row.get("date"),
        data: serde_json::from_str(&data)?,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn metadata() -> UnitMetadata {
        UnitMetadata {
            ip: "10.0.0.10".into(),
            image: "web/1.0/amd64".into(),
            cpu: 2,
            ram: "2GB".into(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_lookup_ignores_case() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let registry = Registry::open(dir.path().join("units.db")).await?;

        let record = registry.insert("Web", &metadata()).await?;
        let found = registry.get_by_name("web").await?;
        assert_eq!(found, record);
        assert_eq!(found.data.cpu, 2);

        assert!(matches!(
            registry.insert("WEB", &metadata()).await,
            Err(MonounitError::Conflict(_))
        ));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_reports_missing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let registry = Registry::open(dir.path().join("units.db")).await?;

        registry.insert("web", &metadata()).await?;
        registry.delete_by_name("WEB").await?;
        assert!(matches!(
            registry.delete_by_name("web").await,
            Err(MonounitError::NotFound(_))
        ));
        assert!(matches!(
            registry.get_by_name("web").await,
            Err(MonounitError::NotFound(_))
        ));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_reconcile_prunes_vanished_units() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let registry = Registry::open(dir.path().join("units.db")).await?;

        registry.insert("api", &metadata()).await?;
        registry.insert("db", &metadata()).await?;
        registry.insert("lab:cache", &metadata()).await?;

        let removed = registry.reconcile(&["API".to_string()]).await?;
        assert_eq!(removed, vec!["db"]);

        // Units on other remotes are not judged by the default remote's listing.
        let mut names: Vec<_> = registry.list().await?.into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["api", "lab:cache"]);
        Ok(())
    }
}
