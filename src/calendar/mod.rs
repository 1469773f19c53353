// src/calendar/mod.rs
// Calendar adapter (spec §6): an opaque external collaborator. "No
// authoritative calendar scheduling logic" lives here (spec §2 non-goals) —
// this module only requests candidate slots and records confirmations.
// Modeled as a capability interface with a null implementation, same shape
// as rag/mod.rs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BookingConfirmation {
    pub confirmation_id: String,
    pub slot: Slot,
}

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("calendar backend unavailable: {0}")]
    Unavailable(String),
    /// The requested slot was taken between offer and booking. Per spec §9's
    /// Open Question resolution: treat as retryable once, then escalate —
    /// that retry policy lives in the orchestrator, not here.
    #[error("slot no longer available: {0:?}")]
    Contention(Slot),
}

#[async_trait]
pub trait CalendarAdapter: Send + Sync {
    async fn list_free_slots(
        &self,
        date_range: (DateTime<Utc>, DateTime<Utc>),
        duration: Duration,
    ) -> Result<Vec<Slot>, CalendarError>;

    async fn book_slot(
        &self,
        slot: Slot,
        attendee: &str,
        notes: &str,
    ) -> Result<BookingConfirmation, CalendarError>;
}

/// Selected when no real calendar backend is configured (spec §9). Offers a
/// fixed set of in-hours slots and always succeeds at booking, so the
/// workflow can be exercised end-to-end without an external dependency.
pub struct NullCalendar;

#[async_trait]
impl CalendarAdapter for NullCalendar {
    async fn list_free_slots(
        &self,
        date_range: (DateTime<Utc>, DateTime<Utc>),
        duration: Duration,
    ) -> Result<Vec<Slot>, CalendarError> {
        let (from, _to) = date_range;
        let mut slots = Vec::new();
        let mut cursor = from;
        while slots.len() < 3 {
            cursor += Duration::days(1);
            slots.push(Slot {
                start: cursor,
                end: cursor + duration,
            });
        }
        Ok(slots)
    }

    async fn book_slot(
        &self,
        slot: Slot,
        _attendee: &str,
        _notes: &str,
    ) -> Result<BookingConfirmation, CalendarError> {
        Ok(BookingConfirmation {
            confirmation_id: Uuid::new_v4().to_string(),
            slot,
        })
    }
}
