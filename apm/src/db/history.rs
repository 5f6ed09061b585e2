// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Append-only journal of applied image configurations,
//! table `host_image_history`

use std::{path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::image::config::ImageConfig;

/// One journal row: the config snapshot that went live, and when
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: i64,
    pub image_name: String,
    pub config: ImageConfig,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    write: Arc<Mutex<()>>,
}

impl Database {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self {
            pool: super::connect(path, false).await?,
            write: Arc::new(Mutex::new(())),
        })
    }

    #[cfg(test)]
    pub(crate) async fn memory() -> Result<Self, Error> {
        use std::str::FromStr as _;
        let options =
            sqlx::sqlite::SqliteConnectOptions::from_str("sqlite::memory:").map_err(sqlx::Error::from)?;
        Ok(Self {
            pool: super::connect_with(options).await?,
            write: Arc::new(Mutex::new(())),
        })
    }

    /// The most recent journal row, if any
    pub async fn latest(&self) -> Result<Option<Entry>, Error> {
        let row = sqlx::query_as::<_, encoding::Row>(
            "
            SELECT id, image_name, config, date
            FROM host_image_history
            ORDER BY id DESC
            LIMIT 1;
            ",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(Entry::try_from).transpose()
    }

    /// Append a row unless the config deep-equals the latest one.
    /// Returns whether a row was written.
    pub async fn add_if_changed(&self, image_name: &str, config: &ImageConfig) -> Result<bool, Error> {
        let _guard = self.write.lock().await;

        if let Some(latest) = self.latest().await? {
            if &latest.config == config {
                return Ok(false);
            }
        }

        sqlx::query(
            "
            INSERT INTO host_image_history (image_name, config, date)
            VALUES (?, ?, ?);
            ",
        )
        .bind(image_name)
        .bind(serde_json::to_string(config)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Paginated journal, newest first, optionally filtered by an image
    /// name substring
    pub async fn list(
        &self,
        image_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, Error> {
        let mut query = QueryBuilder::new(
            "
            SELECT id, image_name, config, date
            FROM host_image_history
            ",
        );
        if let Some(filter) = image_filter {
            query.push(" WHERE image_name LIKE ").push_bind(format!("%{filter}%"));
        }
        query.push(" ORDER BY id DESC LIMIT ").push_bind(limit);
        query.push(" OFFSET ").push_bind(offset);

        let rows = query.build_query_as::<encoding::Row>().fetch_all(&self.pool).await?;

        rows.into_iter().map(Entry::try_from).collect()
    }

    pub async fn count(&self, image_filter: Option<&str>) -> Result<i64, Error> {
        let mut query = QueryBuilder::new(
            "
            SELECT COUNT(*)
            FROM host_image_history
            ",
        );
        if let Some(filter) = image_filter {
            query.push(" WHERE image_name LIKE ").push_bind(format!("%{filter}%"));
        }

        let (count,): (i64,) = query.build_query_as().fetch_one(&self.pool).await?;

        Ok(count)
    }
}

impl TryFrom<encoding::Row> for Entry {
    type Error = Error;

    fn try_from(row: encoding::Row) -> Result<Self, Error> {
        Ok(Entry {
            id: row.id,
            image_name: row.image_name,
            config: serde_json::from_str(&row.config)?,
            date: row.date,
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("sqlx")]
    Sqlx(#[from] sqlx::Error),

    #[error("sqlx migration")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("config snapshot")]
    Snapshot(#[from] serde_json::Error),
}

mod encoding {
    use chrono::{DateTime, Utc};
    use sqlx::FromRow;

    #[derive(FromRow)]
    pub struct Row {
        pub id: i64,
        pub image_name: String,
        pub config: String,
        pub date: DateTime<Utc>,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(install: &[&str]) -> ImageConfig {
        let mut config = ImageConfig::for_image("ghcr.io/example/os:latest");
        for name in install {
            config.add_install(name);
        }
        config
    }

    #[tokio::test]
    async fn append_only_when_changed() {
        let db = Database::memory().await.unwrap();

        assert!(db.add_if_changed("os", &config(&["zip"])).await.unwrap());
        // Identical snapshot: no new row
        assert!(!db.add_if_changed("os", &config(&["zip"])).await.unwrap());
        assert!(db.add_if_changed("os", &config(&["zip", "nano"])).await.unwrap());

        assert_eq!(db.count(None).await.unwrap(), 2);

        let latest = db.latest().await.unwrap().unwrap();
        assert!(latest.config.has_install("nano"));
        assert!(Utc::now().signed_duration_since(latest.date).num_seconds() < 5);
    }

    #[tokio::test]
    async fn list_filter_and_pagination() {
        let db = Database::memory().await.unwrap();
        db.add_if_changed("os-a", &config(&["one"])).await.unwrap();
        db.add_if_changed("os-b", &config(&["two"])).await.unwrap();
        db.add_if_changed("os-b", &config(&["three"])).await.unwrap();

        let all = db.list(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        // Newest first
        assert!(all[0].id > all[1].id);

        let filtered = db.list(Some("os-b"), 10, 0).await.unwrap();
        assert_eq!(filtered.len(), 2);
        assert_eq!(db.count(Some("os-b")).await.unwrap(), 2);

        let page = db.list(None, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, all[1].id);
    }
}
