mod connection;
mod error;
mod models;
/// MongoDB-backed coordination store.
pub mod store;

pub use error::MongoDaoError;
pub use store::MongoCoordStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::CasExhausted { operation } => StorageError::Conflict { operation },
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}

/// Connection settings for the shared MongoDB backend.
pub mod config {
    use mongodb::options::ClientOptions;

    use super::error::{MongoDaoError, MongoResult};

    /// Parsed client options plus the database name.
    #[derive(Clone)]
    pub struct MongoConfig {
        /// Driver options parsed from the connection URI.
        pub options: ClientOptions,
        /// Database holding the coordination collections.
        pub database_name: String,
    }

    impl MongoConfig {
        /// Build a configuration from a connection URI and optional database name.
        pub async fn from_uri(uri: &str, db_name: Option<&str>) -> MongoResult<Self> {
            let database_name = db_name.unwrap_or("bingo_back").to_owned();
            let options =
                ClientOptions::parse(uri)
                    .await
                    .map_err(|source| MongoDaoError::InvalidUri {
                        uri: uri.to_owned(),
                        source,
                    })?;

            Ok(Self {
                options,
                database_name,
            })
        }
    }
}
