//! Queue database connection and initialization.

pub use provisio_core::db::DatabaseError;

provisio_core::define_store!(QueueDatabase, "queue");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = QueueDatabase::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn reopening_file_database_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.db");
        let first = QueueDatabase::open(&path).await.expect("first open");
        first.pool().close().await;
        assert!(QueueDatabase::open(&path).await.is_ok());
    }
}
