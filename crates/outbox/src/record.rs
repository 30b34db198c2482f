//! Outbox record and its status model

use serde_json::Value;
use uuid::Uuid;

use crate::OutboxError;

const MAX_EVENT_TYPE_LEN: usize = 255;

/// Processing state of a stored record.
///
/// The unsent state is SQL NULL and is modeled as the absence of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The record is claimed by a worker.
    Progress,
    /// The record was published to the broker.
    Done,
    /// The record could not be encoded; it will not be retried.
    Failed,
}

impl Status {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "progress" => Some(Self::Progress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An event waiting to be published by the outbox worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: Uuid,
    event_type: String,
    status: Option<Status>,
    payload: Value,
}

impl Record {
    /// Create a record for [`Client::write_record`](crate::Client::write_record).
    ///
    /// `event_type` is the broker subject the payload will be published to;
    /// it must be non-empty and at most 255 bytes. `id` must be unique per
    /// record, duplicates are ignored on insert.
    pub fn new(
        id: Uuid,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Result<Self, OutboxError> {
        let event_type = event_type.into();

        if event_type.is_empty() {
            return Err(OutboxError::InvalidRecord(
                "event type must not be empty".to_string(),
            ));
        }

        if event_type.len() > MAX_EVENT_TYPE_LEN {
            return Err(OutboxError::InvalidRecord(format!(
                "event type must not exceed {MAX_EVENT_TYPE_LEN} bytes",
            )));
        }

        Ok(Self {
            id,
            event_type,
            status: None,
            payload,
        })
    }

    pub(crate) fn restore(
        id: Uuid,
        status: Option<Status>,
        event_type: String,
        payload: Value,
    ) -> Self {
        Self {
            id,
            event_type,
            status,
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub(crate) fn done(&mut self) {
        self.status = Some(Status::Done);
    }

    pub(crate) fn fail(&mut self) {
        self.status = Some(Status::Failed);
    }

    /// Clear the status so the row becomes eligible again on the next tick.
    pub(crate) fn requeue(&mut self) {
        self.status = None;
    }
}
