// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Persistent mirror databases
//!
//! Both tables live in one SQLite file per role (system vs user), so the
//! schema is managed by a single shared migrator.

use std::{path::Path, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Pool, Sqlite,
};

pub mod history;
pub mod packages;

pub(crate) async fn connect(path: impl AsRef<Path>, read_only: bool) -> Result<Pool<Sqlite>, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(!read_only)
        .read_only(read_only)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;

    // A read-only role relies on the writer having migrated already
    if !read_only {
        sqlx::migrate!("src/db/migrations").run(&pool).await?;
    }

    Ok(pool)
}

/// In-memory databases live per connection, so the test pool is capped
/// at a single one
#[cfg(test)]
pub(crate) async fn connect_with(options: SqliteConnectOptions) -> Result<Pool<Sqlite>, sqlx::Error> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}
