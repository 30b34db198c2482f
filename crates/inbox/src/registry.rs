//! Event-type to handler mapping

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

/// Consumer of inbox events.
///
/// The key distinguishes multiple handlers bound to the same event type and
/// must be non-empty and stable: it is persisted with every fanned-out row.
#[async_trait]
pub trait Handler: Send + Sync {
    fn key(&self) -> String;

    async fn process(&self, payload: &[u8]) -> anyhow::Result<()>;
}

pub(crate) type HandlerMap = HashMap<String, Vec<Arc<dyn Handler>>>;

/// Thread-safe registry of handlers, keyed by event type.
///
/// Reads are shared; registration takes the write lock. The engine works on
/// a snapshot taken at construction time.
#[derive(Default)]
pub struct Registry {
    subjects: RwLock<HandlerMap>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind handlers to an event type.
    ///
    /// Handlers with an empty key are dropped. A key already registered for
    /// this event type is dropped too, whether the earlier registration came
    /// from this call or a previous one: first write wins.
    pub fn on(&self, event: &str, handlers: impl IntoIterator<Item = Arc<dyn Handler>>) {
        let mut subjects = self.subjects.write().expect("registry lock poisoned");

        let entry = subjects.entry(event.to_string()).or_default();
        let mut existing: HashSet<String> =
            entry.iter().map(|handler| handler.key()).collect();

        for handler in handlers {
            let key = handler.key();

            if key.is_empty() {
                continue;
            }

            if existing.contains(&key) {
                continue;
            }

            existing.insert(key);
            entry.push(handler);
        }
    }

    /// Deep copy of the current mapping.
    pub(crate) fn handlers(&self) -> HandlerMap {
        self.subjects
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(event, handlers)| (event.clone(), handlers.clone()))
            .collect()
    }

    /// Whether a handler with the given key is registered for the event.
    pub fn contains(&self, event: &str, key: &str) -> bool {
        self.subjects
            .read()
            .expect("registry lock poisoned")
            .get(event)
            .is_some_and(|handlers| handlers.iter().any(|handler| handler.key() == key))
    }
}
