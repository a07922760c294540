//! `SQLite` storage plumbing shared by Provisio components.
//!
//! A store is either a file (shared by several worker processes and the
//! `provisio` CLI) or a private in-memory database used by tests.
//! [`define_store!`](crate::define_store) generates a typed handle that
//! connects and applies the invoking crate's embedded migrations.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

/// How long a writer waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections per file-backed pool.
const FILE_POOL_SIZE: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("cannot prepare database directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open database: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),
}

/// Where a store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    File(PathBuf),
    /// Private to the pool; gone when the pool closes.
    Memory,
}

impl Location {
    fn connect_options(&self) -> SqliteConnectOptions {
        let options = match self {
            Self::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT),
            Self::Memory => SqliteConnectOptions::new().in_memory(true),
        };
        options.foreign_keys(true)
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        match self {
            Self::File(_) => SqlitePoolOptions::new().max_connections(FILE_POOL_SIZE),
            // Every extra in-memory connection would see its own empty
            // database, so keep exactly one and never recycle it.
            Self::Memory => SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
        }
    }
}

/// Connect to `location`, creating the parent directory of a file store.
pub async fn connect(location: &Location) -> Result<Pool<Sqlite>, DatabaseError> {
    let parent = match location {
        Location::File(path) => path.parent().filter(|p| !p.as_os_str().is_empty()),
        Location::Memory => None,
    };
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent).map_err(|source| DatabaseError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let pool = location
        .pool_options()
        .connect_with(location.connect_options())
        .await
        .map_err(DatabaseError::Connection)?;

    match location {
        Location::File(path) => info!(path = %path.display(), "Database opened"),
        Location::Memory => debug!("In-memory database opened"),
    }
    Ok(pool)
}

/// Current time in unix seconds.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Define a store handle named `$name` whose schema comes from the
/// `migrations/` directory of the invoking crate.
///
/// ```ignore
/// provisio_core::define_store!(QueueDatabase, "queue");
/// ```
#[macro_export]
macro_rules! define_store {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            /// Connect and bring the schema up to date.
            pub async fn connect(
                location: &$crate::db::Location,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                let pool = $crate::db::connect(location).await?;
                ::sqlx::migrate!("./migrations").run(&pool).await?;
                ::tracing::debug!(store = $label, "Schema up to date");
                Ok(Self { pool })
            }

            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::connect(&$crate::db::Location::File(path.to_path_buf())).await
            }

            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::connect(&$crate::db::Location::Memory).await
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}
