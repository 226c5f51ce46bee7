//! Abstract repository over the durable relational store. The server is
//! written against this trait; the concrete backend (MySQL, Postgres,
//! SQLite, or the in-memory store) is injected at startup.

pub mod memory;
pub mod sql;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::common::error::Result;

pub use memory::MemoryRepository;
pub use sql::SqlRepository;

/// A user's face row: display name, transport-encoded face image, active flag.
#[derive(Debug, Clone)]
pub struct FaceRow {
    pub name: String,
    pub record: String,
    pub is_active: bool,
}

/// Search result row for name lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    pub enroll_id: i64,
    pub name: String,
    pub is_active: bool,
}

/// Attendance rows for the same user within this window are dropped.
pub const ATTENDANCE_DEBOUNCE_SECS: i64 = 20;

/// Smallest enrollment id the allocator will hand out.
pub const MIN_ENROLL_ID: i64 = 1000;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Whether the user already has a face template on record.
    async fn has_face_data(&self, enroll_id: i64) -> Result<bool>;

    /// Insert or replace the user's row for the given backup slot.
    async fn upsert_user(
        &self,
        enroll_id: i64,
        name: &str,
        backup_num: i32,
        is_admin: bool,
        record: &str,
    ) -> Result<()>;

    /// Purge every row belonging to the id, across all backup slots.
    async fn delete_user(&self, enroll_id: i64) -> Result<()>;

    async fn set_user_active(&self, enroll_id: i64, active: bool) -> Result<()>;

    /// Record an attendance punch. Returns false when the punch fell inside
    /// the per-user debounce window and was dropped.
    async fn log_attendance(&self, enroll_id: i64, device_serial: &str, time: &str) -> Result<bool>;

    /// Case-insensitive substring search over user names.
    async fn search_users_by_name(&self, fragment: &str) -> Result<Vec<UserSummary>>;

    /// Allocate the next enrollment id: monotonically increasing, floored to
    /// `MIN_ENROLL_ID`, never reused even under contention.
    async fn next_enroll_id(&self) -> Result<i64>;

    /// Light snapshot for reconciliation: ids that have face data, mapped to
    /// their active flag. Never pulls the image blobs.
    async fn snapshot_active_face_users(&self) -> Result<HashMap<i64, bool>>;

    /// Full face row for a single user, image included.
    async fn fetch_face_row(&self, enroll_id: i64) -> Result<Option<FaceRow>>;
}

pub(crate) fn within_debounce(previous: &str, current: &str) -> bool {
    use crate::protocol::TIME_FORMAT;
    let parse = |s: &str| chrono::NaiveDateTime::parse_from_str(s, TIME_FORMAT).ok();
    match (parse(previous), parse(current)) {
        (Some(prev), Some(now)) => {
            let delta = (now - prev).num_seconds();
            delta.abs() < ATTENDANCE_DEBOUNCE_SECS
        }
        // Unparseable history never suppresses a fresh punch
        _ => false,
    }
}
