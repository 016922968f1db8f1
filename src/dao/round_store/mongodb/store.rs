use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{DateTime, doc},
    options::{IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{
        GuardDocument, LeaseDocument, LockDocument, ROUND_DOC_ID, RateDocument, RoundDocument,
        expiry_after, window_threshold,
    },
};
use crate::dao::{
    models::{AppendOutcome, CardGrid, ReleaseOutcome, ReserveOutcome, RoundOutcome, RoundRecord},
    round_store::{GuardStore, PresenceStore, RoundStore},
    storage::StorageResult,
};

const ROUND_COLLECTION: &str = "round";
const GUARD_COLLECTION: &str = "guard";
const RATE_COLLECTION: &str = "rates";
const PRESENCE_COLLECTION: &str = "presence";
const LOCK_COLLECTION: &str = "locks";

/// How many read-compare-write attempts a round mutation gets before
/// surfacing a conflict to the caller.
const CAS_ATTEMPTS: usize = 4;

/// Coordination store backed by a shared MongoDB deployment.
///
/// Round mutations are optimistic: read the versioned document, apply the
/// entity-level rule, and write back guarded by the version. Expiring
/// collections carry TTL indexes, but every query still filters on
/// `expires_at` because TTL eviction is lazy.
#[derive(Clone)]
pub struct MongoCoordStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11_000,
        ErrorKind::Command(command_error) => command_error.code == 11_000,
        _ => false,
    }
}

impl MongoCoordStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;

        for collection_name in [GUARD_COLLECTION, PRESENCE_COLLECTION, LOCK_COLLECTION] {
            let collection = database.collection::<mongodb::bson::Document>(collection_name);
            let index = IndexModel::builder()
                .keys(doc! { "expires_at": 1 })
                .options(
                    IndexOptions::builder()
                        .name(Some(format!("{collection_name}_ttl_idx")))
                        .expire_after(Some(Duration::ZERO))
                        .build(),
                )
                .build();

            collection
                .create_index(index)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection: collection_name,
                    index: "expires_at",
                    source,
                })?;
        }

        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn round_collection(&self) -> Collection<RoundDocument> {
        self.database().await.collection(ROUND_COLLECTION)
    }

    async fn guard_collection(&self) -> Collection<GuardDocument> {
        self.database().await.collection(GUARD_COLLECTION)
    }

    async fn rate_collection(&self) -> Collection<RateDocument> {
        self.database().await.collection(RATE_COLLECTION)
    }

    async fn presence_collection(&self) -> Collection<LeaseDocument> {
        self.database().await.collection(PRESENCE_COLLECTION)
    }

    async fn lock_collection(&self) -> Collection<LockDocument> {
        self.database().await.collection(LOCK_COLLECTION)
    }

    async fn load(&self) -> MongoResult<RoundRecord> {
        let document = self
            .round_collection()
            .await
            .find_one(doc! { "_id": ROUND_DOC_ID })
            .await
            .map_err(|source| MongoDaoError::LoadRound { source })?;

        Ok(document.map_or_else(RoundRecord::empty, RoundDocument::into_record))
    }

    /// Apply an entity-level mutation under optimistic concurrency control.
    ///
    /// `apply` must be side-effect free outside the record: it may run more
    /// than once when the version race is lost.
    async fn mutate_round<T, F>(&self, operation: &'static str, apply: F) -> MongoResult<T>
    where
        F: Fn(&mut RoundRecord) -> T,
    {
        let collection = self.round_collection().await;

        for _ in 0..CAS_ATTEMPTS {
            let current = collection
                .find_one(doc! { "_id": ROUND_DOC_ID })
                .await
                .map_err(|source| MongoDaoError::LoadRound { source })?;

            match current {
                Some(document) => {
                    let version = document.version;
                    let mut record = document.into_record();
                    let value = apply(&mut record);
                    let next = RoundDocument::from_record(&record, version + 1);

                    let result = collection
                        .replace_one(doc! { "_id": ROUND_DOC_ID, "version": version }, &next)
                        .await
                        .map_err(|source| MongoDaoError::WriteRound { operation, source })?;
                    if result.matched_count == 1 {
                        return Ok(value);
                    }
                }
                None => {
                    let mut record = RoundRecord::empty();
                    let value = apply(&mut record);
                    let next = RoundDocument::from_record(&record, 1);

                    match collection.insert_one(&next).await {
                        Ok(_) => return Ok(value),
                        Err(err) if is_duplicate_key(&err) => {}
                        Err(source) => {
                            return Err(MongoDaoError::WriteRound { operation, source });
                        }
                    }
                }
            }
        }

        Err(MongoDaoError::CasExhausted { operation })
    }
}

impl RoundStore for MongoCoordStore {
    fn load_round(&self) -> BoxFuture<'static, StorageResult<RoundRecord>> {
        let store = self.clone();
        Box::pin(async move { store.load().await.map_err(Into::into) })
    }

    fn begin_round(
        &self,
        pool: Vec<CardGrid>,
        countdown: u32,
    ) -> BoxFuture<'static, StorageResult<RoundRecord>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("begin_round", move |record| {
                    record.begin(pool.clone(), countdown);
                    record.clone()
                })
                .await
                .map_err(Into::into)
        })
    }

    fn decrement_countdown(&self) -> BoxFuture<'static, StorageResult<u32>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("decrement_countdown", |record| record.decrement_countdown())
                .await
                .map_err(Into::into)
        })
    }

    fn set_active(&self) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("set_active", |record| record.activate())
                .await
                .map_err(Into::into)
        })
    }

    fn append_called(&self, number: u8) -> BoxFuture<'static, StorageResult<AppendOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("append_called", move |record| record.append_called(number))
                .await
                .map_err(Into::into)
        })
    }

    fn reserve_slots(
        &self,
        identity: String,
        desired: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<ReserveOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("reserve_slots", move |record| {
                    record.try_reserve(&identity, &desired)
                })
                .await
                .map_err(Into::into)
        })
    }

    fn release_slots(
        &self,
        identity: String,
        slots: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<ReleaseOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("release_slots", move |record| {
                    record.release(&identity, &slots)
                })
                .await
                .map_err(Into::into)
        })
    }

    fn release_owner(&self, identity: String) -> BoxFuture<'static, StorageResult<ReleaseOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("release_owner", move |record| record.release_owner(&identity))
                .await
                .map_err(Into::into)
        })
    }

    fn finish_round(
        &self,
        outcome: RoundOutcome,
        winners_cap: usize,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .mutate_round("finish_round", move |record| {
                    record.finish(outcome.clone(), winners_cap)
                })
                .await
                .map_err(Into::into)
        })
    }

    fn acquire_lock(
        &self,
        name: String,
        holder: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let collection = store.lock_collection().await;
            let now = DateTime::now();

            // Matches when the lock is free to take (expired) or already ours;
            // otherwise the upsert collides with the live document's _id and
            // the duplicate-key error means "held by someone else".
            let result = collection
                .find_one_and_update(
                    doc! {
                        "_id": &name,
                        "$or": [
                            { "expires_at": { "$lte": now } },
                            { "holder": &holder },
                        ],
                    },
                    doc! { "$set": { "holder": &holder, "expires_at": expiry_after(ttl) } },
                )
                .upsert(true)
                .return_document(ReturnDocument::After)
                .await;

            match result {
                Ok(_) => Ok(true),
                Err(err) if is_duplicate_key(&err) => Ok(false),
                Err(source) => Err(MongoDaoError::Lock {
                    operation: "acquire",
                    source,
                }
                .into()),
            }
        })
    }

    fn release_lock(
        &self,
        name: String,
        holder: String,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .lock_collection()
                .await
                .delete_one(doc! { "_id": &name, "holder": &holder })
                .await
                .map_err(|source| MongoDaoError::Lock {
                    operation: "release",
                    source,
                })?;
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}

impl GuardStore for MongoCoordStore {
    fn fetch_response(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let store = self.clone();
        Box::pin(async move {
            let document = store
                .guard_collection()
                .await
                .find_one(doc! { "_id": &key, "expires_at": { "$gt": DateTime::now() } })
                .await
                .map_err(|source| MongoDaoError::Guard {
                    operation: "fetch_response",
                    source,
                })?;
            Ok(document.map(|entry| entry.response))
        })
    }

    fn record_response(
        &self,
        key: String,
        response: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let document = GuardDocument {
                key: key.clone(),
                response,
                expires_at: expiry_after(ttl),
            };
            store
                .guard_collection()
                .await
                .replace_one(doc! { "_id": &key }, &document)
                .upsert(true)
                .await
                .map_err(|source| MongoDaoError::Guard {
                    operation: "record_response",
                    source,
                })?;
            Ok(())
        })
    }

    fn bump_rate(&self, key: String, window: Duration) -> BoxFuture<'static, StorageResult<u32>> {
        let store = self.clone();
        Box::pin(async move {
            let collection = store.rate_collection().await;

            let bumped = collection
                .find_one_and_update(
                    doc! { "_id": &key, "window_start": { "$gt": window_threshold(window) } },
                    doc! { "$inc": { "count": 1 } },
                )
                .return_document(ReturnDocument::After)
                .await
                .map_err(|source| MongoDaoError::Guard {
                    operation: "bump_rate",
                    source,
                })?;

            if let Some(document) = bumped {
                return Ok(document.count.max(0) as u32);
            }

            // No live window: open a fresh one. A concurrent opener is fine,
            // both observe count 1 inside the same window width.
            let document = RateDocument {
                key: key.clone(),
                window_start: DateTime::now(),
                count: 1,
            };
            collection
                .replace_one(doc! { "_id": &key }, &document)
                .upsert(true)
                .await
                .map_err(|source| MongoDaoError::Guard {
                    operation: "bump_rate",
                    source,
                })?;
            Ok(1)
        })
    }
}

impl PresenceStore for MongoCoordStore {
    fn claim_lease(
        &self,
        identity: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let result = store
                .presence_collection()
                .await
                .find_one_and_update(
                    doc! {
                        "_id": &identity,
                        "$or": [
                            { "expires_at": { "$lte": DateTime::now() } },
                            { "token": &token },
                        ],
                    },
                    doc! { "$set": { "token": &token, "expires_at": expiry_after(ttl) } },
                )
                .upsert(true)
                .return_document(ReturnDocument::After)
                .await;

            match result {
                Ok(_) => Ok(true),
                Err(err) if is_duplicate_key(&err) => Ok(false),
                Err(source) => Err(MongoDaoError::Presence {
                    operation: "claim",
                    source,
                }
                .into()),
            }
        })
    }

    fn refresh_lease(
        &self,
        identity: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let result = store
                .presence_collection()
                .await
                .update_one(
                    doc! {
                        "_id": &identity,
                        "token": &token,
                        "expires_at": { "$gt": DateTime::now() },
                    },
                    doc! { "$set": { "expires_at": expiry_after(ttl) } },
                )
                .await
                .map_err(|source| MongoDaoError::Presence {
                    operation: "refresh",
                    source,
                })?;
            Ok(result.matched_count > 0)
        })
    }

    fn release_lease(
        &self,
        identity: String,
        token: String,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .presence_collection()
                .await
                .delete_one(doc! { "_id": &identity, "token": &token })
                .await
                .map_err(|source| MongoDaoError::Presence {
                    operation: "release",
                    source,
                })?;
            Ok(())
        })
    }

    fn lease_count(&self) -> BoxFuture<'static, StorageResult<usize>> {
        let store = self.clone();
        Box::pin(async move {
            let count = store
                .presence_collection()
                .await
                .count_documents(doc! { "expires_at": { "$gt": DateTime::now() } })
                .await
                .map_err(|source| MongoDaoError::Presence {
                    operation: "count",
                    source,
                })?;
            Ok(count as usize)
        })
    }
}
