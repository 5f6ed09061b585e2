// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Local mirror of the package universe, table `host_image_packages`
//!
//! Rows are replaced wholesale on every index refresh; installation
//! state is reconciled separately through [`Database::sync_installation_info`].

use std::{collections::HashMap, path::Path, str::FromStr, sync::Arc};

use sqlx::{Acquire, Pool, QueryBuilder, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::environment::DB_BATCH_SIZE;
use crate::package::{Package, TypePackage};

/// Fields usable in filters and sorts. Anything else is rejected before
/// it reaches the query builder.
const TEXT_FIELDS: &[&str] = &[
    "name",
    "section",
    "maintainer",
    "version",
    "version_installed",
    "filename",
    "description",
];
const EXACT_FIELDS: &[&str] = &["installed_size", "size", "type_package"];

/// Sort direction; anything unrecognized falls back to ascending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn parse(text: &str) -> Self {
        match text.to_uppercase().as_str() {
            "DESC" => Order::Desc,
            _ => Order::Asc,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// Parameters of a paginated mirror query
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: HashMap<String, String>,
    pub sort: Option<String>,
    pub order: Order,
    pub limit: Option<i64>,
    pub offset: i64,
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
        let options = sqlx::sqlite::SqliteConnectOptions::from_str("sqlite::memory:").map_err(sqlx::Error::from)?;
        Ok(Self {
            pool: super::connect_with(options).await?,
            write: Arc::new(Mutex::new(())),
        })
    }

    /// Wholesale replacement of the mirror: truncate, then batched
    /// inserts inside one transaction
    pub async fn save(&self, packages: &[Package]) -> Result<(), Error> {
        let _guard = self.write.lock().await;
        let mut transaction = self.pool.begin().await?;

        sqlx::query("DELETE FROM host_image_packages;")
            .execute(transaction.acquire().await?)
            .await?;

        for chunk in packages.chunks(DB_BATCH_SIZE) {
            QueryBuilder::new(
                "
                INSERT INTO host_image_packages (
                    name,
                    section,
                    installed_size,
                    maintainer,
                    version,
                    version_installed,
                    depends,
                    provides,
                    size,
                    filename,
                    description,
                    changelog,
                    installed,
                    type_package
                )
                ",
            )
            .push_values(chunk, |mut b, package| {
                b.push_bind(&package.name)
                    .push_bind(&package.section)
                    .push_bind(package.installed_size)
                    .push_bind(&package.maintainer)
                    .push_bind(&package.version)
                    .push_bind(&package.version_installed)
                    .push_bind(encode_list(&package.depends))
                    .push_bind(encode_list(&package.provides))
                    .push_bind(package.size)
                    .push_bind(&package.filename)
                    .push_bind(&package.description)
                    .push_bind(&package.changelog)
                    .push_bind(package.installed as i64)
                    .push_bind(package.type_package.to_string());
            })
            .build()
            .execute(transaction.acquire().await?)
            .await?;
        }

        transaction.commit().await?;

        Ok(())
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Package, Error> {
        let row = sqlx::query_as::<_, encoding::Row>(
            "
            SELECT *
            FROM host_image_packages
            WHERE name = ?;
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Package::from).ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// Case-insensitive substring search over names
    pub async fn search(&self, name_part: &str, installed_only: bool) -> Result<Vec<Package>, Error> {
        let mut query = QueryBuilder::new(
            "
            SELECT *
            FROM host_image_packages
            WHERE name LIKE ",
        );
        query.push_bind(format!("%{name_part}%"));
        if installed_only {
            query.push(" AND installed = 1");
        }
        query.push(" ORDER BY name ASC");

        let rows = query.build_query_as::<encoding::Row>().fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Package::from).collect())
    }

    pub async fn query(&self, params: &Query) -> Result<Vec<Package>, Error> {
        let mut query = QueryBuilder::new(
            "
            SELECT *
            FROM host_image_packages
            ",
        );
        push_filters(&mut query, &params.filters)?;

        let sort = match params.sort.as_deref() {
            Some(field) => validated_field(field)?,
            None => "name",
        };
        query.push(format!(" ORDER BY {sort} {}", params.order.sql()));

        if let Some(limit) = params.limit {
            query.push(" LIMIT ").push_bind(limit);
            query.push(" OFFSET ").push_bind(params.offset);
        }

        let rows = query.build_query_as::<encoding::Row>().fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Package::from).collect())
    }

    /// Row count under the same filter semantics as [`Database::query`]
    pub async fn count(&self, filters: &HashMap<String, String>) -> Result<i64, Error> {
        let mut query = QueryBuilder::new(
            "
            SELECT COUNT(*)
            FROM host_image_packages
            ",
        );
        push_filters(&mut query, filters)?;

        let (count,): (i64,) = query.build_query_as().fetch_one(&self.pool).await?;

        Ok(count)
    }

    /// Join the rpm-level installed set against the mirror: one bulk
    /// temp-table load, one UPDATE, one transaction
    pub async fn sync_installation_info(&self, installed: &HashMap<String, String>) -> Result<(), Error> {
        let _guard = self.write.lock().await;
        let mut transaction = self.pool.begin().await?;

        sqlx::query("CREATE TEMP TABLE tmp_installed (name TEXT NOT NULL PRIMARY KEY, version TEXT NOT NULL);")
            .execute(transaction.acquire().await?)
            .await?;

        let entries: Vec<_> = installed.iter().collect();
        for chunk in entries.chunks(DB_BATCH_SIZE) {
            QueryBuilder::new("INSERT INTO tmp_installed (name, version) ")
                .push_values(chunk, |mut b, (name, version)| {
                    b.push_bind(*name).push_bind(*version);
                })
                .build()
                .execute(transaction.acquire().await?)
                .await?;
        }

        sqlx::query(
            "
            UPDATE host_image_packages
            SET installed = EXISTS (
                    SELECT 1 FROM tmp_installed t WHERE t.name = host_image_packages.name
                ),
                version_installed = COALESCE(
                    (SELECT version FROM tmp_installed t WHERE t.name = host_image_packages.name),
                    ''
                );
            ",
        )
        .execute(transaction.acquire().await?)
        .await?;

        sqlx::query("DROP TABLE tmp_installed;")
            .execute(transaction.acquire().await?)
            .await?;

        transaction.commit().await?;

        Ok(())
    }

    /// Packages whose `provides` set carries the given name, used to
    /// hint alternatives for unknown inputs
    pub async fn find_by_provides(&self, name: &str) -> Result<Vec<Package>, Error> {
        let rows = sqlx::query_as::<_, encoding::Row>(
            "
            SELECT *
            FROM host_image_packages
            WHERE provides LIKE ?
            ORDER BY name ASC;
            ",
        )
        // The column holds a JSON array, entries are quoted
        .bind(format!("%\"{name}\"%"))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Package::from).collect())
    }

    /// True iff the mirror holds at least one row
    pub async fn exists(&self) -> Result<bool, Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM host_image_packages;")
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, filters: &HashMap<String, String>) -> Result<(), Error> {
    let mut first = true;
    // Deterministic clause order
    let mut fields: Vec<_> = filters.iter().collect();
    fields.sort_by_key(|(field, _)| field.as_str().to_owned());

    for (field, value) in fields {
        query.push(if first { " WHERE " } else { " AND " });
        first = false;

        if field == "installed" {
            let flag = matches!(value.trim().to_lowercase().as_str(), "1" | "true");
            query.push("installed = ").push_bind(flag as i64);
        } else if TEXT_FIELDS.contains(&field.as_str()) {
            query
                .push(format!("{field} LIKE "))
                .push_bind(format!("%{value}%"));
        } else if EXACT_FIELDS.contains(&field.as_str()) {
            query.push(format!("{field} = ")).push_bind(value.clone());
        } else {
            return Err(Error::UnknownField(field.clone()));
        }
    }

    Ok(())
}

/// Resolve a caller-supplied field to its whitelisted static spelling;
/// only whitelist members are ever spliced into SQL
fn validated_field(field: &str) -> Result<&'static str, Error> {
    if field == "installed" {
        return Ok("installed");
    }
    TEXT_FIELDS
        .iter()
        .chain(EXACT_FIELDS)
        .find(|f| **f == field)
        .copied()
        .ok_or_else(|| Error::UnknownField(field.to_owned()))
}

fn encode_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_owned())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("package {0} not found")]
    NotFound(String),

    #[error("unknown field {0}")]
    UnknownField(String),

    #[error("sqlx")]
    Sqlx(#[from] sqlx::Error),

    #[error("sqlx migration")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

mod encoding {
    use sqlx::FromRow;

    use super::{FromStr, Package, TypePackage};

    #[derive(FromRow)]
    pub struct Row {
        pub name: String,
        pub section: String,
        pub installed_size: i64,
        pub maintainer: String,
        pub version: String,
        pub version_installed: String,
        pub depends: String,
        pub provides: String,
        pub size: i64,
        pub filename: String,
        pub description: String,
        pub changelog: String,
        pub installed: i64,
        pub type_package: String,
    }

    impl From<Row> for Package {
        fn from(row: Row) -> Self {
            Package {
                name: row.name,
                section: row.section,
                installed_size: row.installed_size,
                maintainer: row.maintainer,
                version: row.version,
                version_installed: row.version_installed,
                depends: serde_json::from_str(&row.depends).unwrap_or_default(),
                provides: serde_json::from_str(&row.provides).unwrap_or_default(),
                size: row.size,
                filename: row.filename,
                description: row.description,
                changelog: row.changelog,
                installed: row.installed != 0,
                type_package: TypePackage::from_str(&row.type_package).unwrap_or_default(),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(name: &str, installed: bool) -> Package {
        Package {
            name: name.to_owned(),
            section: "Archiving".to_owned(),
            version: "1.0-alt1".to_owned(),
            version_installed: if installed { "1.0-alt1".to_owned() } else { String::new() },
            depends: vec!["libc".to_owned()],
            provides: vec![format!("{name}-tools")],
            installed,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_round_trip() {
        let db = Database::memory().await.unwrap();
        let package = sample("zip", true);
        db.save(std::slice::from_ref(&package)).await.unwrap();

        let loaded = db.get_by_name("zip").await.unwrap();
        assert_eq!(loaded, package);

        assert!(matches!(db.get_by_name("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn save_replaces_wholesale() {
        let db = Database::memory().await.unwrap();
        db.save(&[sample("zip", false), sample("unzip", false)]).await.unwrap();
        db.save(&[sample("nano", false)]).await.unwrap();

        assert!(db.get_by_name("zip").await.is_err());
        assert!(db.get_by_name("nano").await.is_ok());
        assert!(db.exists().await.unwrap());
    }

    #[tokio::test]
    async fn search_installed_only() {
        let db = Database::memory().await.unwrap();
        db.save(&[sample("zip", true), sample("unzip", false)]).await.unwrap();

        let hits = db.search("ZIP", false).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = db.search("zip", true).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "zip");
    }

    #[tokio::test]
    async fn query_count_agree() {
        let db = Database::memory().await.unwrap();
        db.save(&[sample("zip", true), sample("unzip", false), sample("nano", true)])
            .await
            .unwrap();

        let mut filters = HashMap::new();
        filters.insert("installed".to_owned(), "1".to_owned());

        let params = Query {
            filters: filters.clone(),
            ..Default::default()
        };
        let rows = db.query(&params).await.unwrap();
        let count = db.count(&filters).await.unwrap();
        assert_eq!(rows.len() as i64, count);
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn query_pagination_and_sort() {
        let db = Database::memory().await.unwrap();
        db.save(&[sample("a", false), sample("b", false), sample("c", false)])
            .await
            .unwrap();

        let params = Query {
            sort: Some("name".to_owned()),
            order: Order::Desc,
            limit: Some(2),
            offset: 1,
            ..Default::default()
        };
        let rows = db.query(&params).await.unwrap();
        let names: Vec<_> = rows.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[tokio::test]
    async fn unknown_filter_field_rejected() {
        let db = Database::memory().await.unwrap();
        let mut filters = HashMap::new();
        filters.insert("name; DROP TABLE".to_owned(), "x".to_owned());
        assert!(matches!(db.count(&filters).await, Err(Error::UnknownField(_))));
    }

    #[tokio::test]
    async fn provides_lookup() {
        let db = Database::memory().await.unwrap();
        db.save(&[sample("zip", false), sample("unzip", false)]).await.unwrap();

        let hits = db.find_by_provides("zip-tools").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "zip");
        assert!(db.find_by_provides("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_installation_info() {
        let db = Database::memory().await.unwrap();
        db.save(&[sample("zip", false), sample("unzip", true)]).await.unwrap();

        let mut installed = HashMap::new();
        installed.insert("zip".to_owned(), "2.0-alt1".to_owned());
        db.sync_installation_info(&installed).await.unwrap();

        let zip = db.get_by_name("zip").await.unwrap();
        assert!(zip.installed);
        assert_eq!(zip.version_installed, "2.0-alt1");

        // No longer present in the installed set
        let unzip = db.get_by_name("unzip").await.unwrap();
        assert!(!unzip.installed);
        assert_eq!(unzip.version_installed, "");
    }

    #[test]
    fn order_parsing() {
        assert_eq!(Order::parse("desc"), Order::Desc);
        assert_eq!(Order::parse("bogus"), Order::Asc);
    }
}
