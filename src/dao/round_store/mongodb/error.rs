//! Error types shared by the MongoDB storage implementation.

use thiserror::Error;

/// Convenient result alias returning [`MongoDaoError`] failures.
pub type MongoResult<T> = Result<T, MongoDaoError>;

/// Failures that can occur while interacting with MongoDB.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// The connection URI could not be parsed.
    #[error("invalid MongoDB URI `{uri}`")]
    InvalidUri {
        /// The offending URI.
        uri: String,
        #[source]
        /// Driver-level parse failure.
        source: mongodb::error::Error,
    },
    /// The client could not be constructed from its options.
    #[error("failed to construct MongoDB client")]
    ClientConstruction {
        #[source]
        /// Driver-level construction failure.
        source: mongodb::error::Error,
    },
    /// The initial ping never succeeded within the retry budget.
    #[error("MongoDB did not answer the initial ping after {attempts} attempts")]
    InitialPing {
        /// Number of attempts made.
        attempts: u32,
        #[source]
        /// Last ping failure.
        source: mongodb::error::Error,
    },
    /// A health check ping failed.
    #[error("MongoDB health ping failed")]
    HealthPing {
        #[source]
        /// Driver-level ping failure.
        source: mongodb::error::Error,
    },
    /// Creating an index failed.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        /// Collection the index belongs to.
        collection: &'static str,
        /// Index description.
        index: &'static str,
        #[source]
        /// Driver-level failure.
        source: mongodb::error::Error,
    },
    /// Reading the round document failed.
    #[error("failed to load the round document")]
    LoadRound {
        #[source]
        /// Driver-level read failure.
        source: mongodb::error::Error,
    },
    /// Writing the round document failed.
    #[error("failed to write the round document during `{operation}`")]
    WriteRound {
        /// Store operation being applied.
        operation: &'static str,
        #[source]
        /// Driver-level write failure.
        source: mongodb::error::Error,
    },
    /// The optimistic concurrency retry budget ran out.
    #[error("optimistic retries exhausted during `{operation}`")]
    CasExhausted {
        /// Store operation that kept losing the version race.
        operation: &'static str,
    },
    /// A command-guard collection operation failed.
    #[error("command guard `{operation}` failed")]
    Guard {
        /// Guard operation name.
        operation: &'static str,
        #[source]
        /// Driver-level failure.
        source: mongodb::error::Error,
    },
    /// A presence-lease collection operation failed.
    #[error("presence `{operation}` failed")]
    Presence {
        /// Presence operation name.
        operation: &'static str,
        #[source]
        /// Driver-level failure.
        source: mongodb::error::Error,
    },
    /// An advisory-lock collection operation failed.
    #[error("advisory lock `{operation}` failed")]
    Lock {
        /// Lock operation name.
        operation: &'static str,
        #[source]
        /// Driver-level failure.
        source: mongodb::error::Error,
    },
}
