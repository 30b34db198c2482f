//! Writer used inside application transactions

use std::sync::Arc;

use sqlx::PgExecutor;

use crate::OutboxError;
use crate::record::Record;
use crate::storage::Storage;

/// Enqueue interface handed out by [`Outbox::writer`](crate::Outbox::writer).
#[derive(Clone)]
pub struct Client {
    storage: Arc<Storage>,
}

impl Client {
    pub(crate) fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Store a record for later publication.
    ///
    /// `executor` is supplied by the caller so the insert participates in
    /// the transaction of the business write; pass `&mut *tx` for an open
    /// transaction or a pool reference for standalone writes. A record whose
    /// id already exists is silently ignored.
    pub async fn write_record<'e, E>(&self, executor: E, record: &Record) -> Result<(), OutboxError>
    where
        E: PgExecutor<'e>,
    {
        self.storage.insert(executor, record).await
    }
}
