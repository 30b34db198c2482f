//! Inbox record with retry bookkeeping

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::InboxError;

const MAX_EVENT_TYPE_LEN: usize = 255;

/// Processing state of a stored record.
///
/// The unprocessed state is SQL NULL and is modeled as the absence of a
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The record is claimed by a worker.
    Progress,
    /// A handler processed the record.
    Done,
    /// The last handler call failed; the record becomes eligible again at
    /// `next_attempt`.
    Failed,
    /// The record exhausted its retry budget. Terminal.
    Dead,
}

impl Status {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "progress" => Some(Self::Progress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// An incoming event addressed to a single handler.
///
/// `Client::write_record` fans a freshly created record out to one row per
/// registered handler key; rows claimed from the table carry the key of the
/// handler they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: Uuid,
    event_type: String,
    handler_key: String,
    status: Option<Status>,
    payload: Vec<u8>,
    attempt: i32,
    error_message: Option<String>,
    next_attempt: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a record for [`Client::write_record`](crate::Client::write_record).
    ///
    /// `id` and the handler key form the uniqueness constraint, so the same
    /// event id may be stored once per handler. `event_type` must be
    /// non-empty and at most 255 bytes.
    pub fn new(
        id: Uuid,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Self, InboxError> {
        let event_type = event_type.into();

        if event_type.is_empty() {
            return Err(InboxError::InvalidRecord(
                "event type must not be empty".to_string(),
            ));
        }

        if event_type.len() > MAX_EVENT_TYPE_LEN {
            return Err(InboxError::InvalidRecord(format!(
                "event type must not exceed {MAX_EVENT_TYPE_LEN} bytes",
            )));
        }

        Ok(Self {
            id,
            event_type,
            handler_key: String::new(),
            status: None,
            payload,
            attempt: 0,
            error_message: None,
            next_attempt: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: Uuid,
        status: Option<Status>,
        event_type: String,
        handler_key: String,
        payload: Vec<u8>,
        attempt: i32,
        error_message: Option<String>,
        next_attempt: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            event_type,
            handler_key,
            status,
            payload,
            attempt,
            error_message,
            next_attempt,
        }
    }

    /// Copy of this record addressed to the given handler key.
    pub(crate) fn with_handler_key(&self, key: &str) -> Self {
        Self {
            id: self.id,
            event_type: self.event_type.clone(),
            handler_key: key.to_string(),
            status: self.status,
            payload: self.payload.clone(),
            attempt: self.attempt,
            error_message: self.error_message.clone(),
            next_attempt: self.next_attempt,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn handler_key(&self) -> &str {
        &self.handler_key
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn next_attempt(&self) -> Option<DateTime<Utc>> {
        self.next_attempt
    }

    pub(crate) fn done(&mut self) {
        self.status = Some(Status::Done);
    }

    /// Record a failed handler call: bumps the attempt counter and stores
    /// the error message.
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.status = Some(Status::Failed);
        self.attempt += 1;
        self.error_message = Some(message.into());
    }

    pub(crate) fn dead(&mut self) {
        self.status = Some(Status::Dead);
    }

    /// Clear the status so the row becomes eligible again on the next tick.
    /// Attempt bookkeeping is left untouched.
    pub(crate) fn requeue(&mut self) {
        self.status = None;
    }

    /// Schedule the next retry `delay` from now.
    pub(crate) fn calc_new_deadline(&mut self, delay: Duration) {
        self.next_attempt = Some(Utc::now() + delay);
    }
}
