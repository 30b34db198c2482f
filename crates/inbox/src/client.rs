//! Writer that fans incoming events out to handler rows

use std::collections::HashMap;
use std::sync::Arc;

use crate::InboxError;
use crate::record::Record;
use crate::registry::HandlerMap;
use crate::storage::Storage;

/// Enqueue interface handed out by [`Inbox::writer`](crate::Inbox::writer).
///
/// Holds the handler keys known at the time the writer was created; events
/// of an unknown type are dropped silently.
#[derive(Clone)]
pub struct Client {
    storage: Arc<Storage>,
    handler_keys: HashMap<String, Vec<String>>,
}

impl Client {
    pub(crate) fn new(storage: Arc<Storage>, handlers: &HandlerMap) -> Self {
        let handler_keys = handlers
            .iter()
            .map(|(event, handlers)| {
                let keys = handlers.iter().map(|handler| handler.key()).collect();

                (event.clone(), keys)
            })
            .collect();

        Self {
            storage,
            handler_keys,
        }
    }

    /// Store one row per handler registered for the record's event type,
    /// each carrying its own copy of the payload.
    ///
    /// Re-delivering the same record is idempotent: duplicate
    /// `(id, handler_key)` pairs are ignored on insert.
    pub async fn write_record(&self, record: &Record) -> Result<(), InboxError> {
        let Some(keys) = self.handler_keys.get(record.event_type()) else {
            return Ok(());
        };

        for key in keys {
            let row = record.with_handler_key(key);

            self.storage.insert(&row).await?;
        }

        Ok(())
    }
}
