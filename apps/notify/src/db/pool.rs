use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

use crate::error::StorageError;

pub type DbPool = Pool<AsyncPgConnection>;

/// The worker holds one connection per in-flight mutation, so a small pool
/// is plenty.
const MAX_CONNECTIONS: usize = 8;

/// Create a Diesel async connection pool. Connections are opened lazily.
pub fn connect(database_url: &str) -> Result<DbPool, StorageError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(MAX_CONNECTIONS)
        .build()
        .map_err(|e| StorageError::Unavailable(format!("failed to build connection pool: {e}")))?;

    tracing::info!(max_size = MAX_CONNECTIONS, "database pool created");

    Ok(pool)
}
