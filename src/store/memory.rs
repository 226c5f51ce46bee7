//! In-memory repository: the same contract as the SQL backend, held in
//! mutex-guarded maps. Used by the test suite and available for running the
//! server without a database (`connection_string = "memory"`).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::common::error::Result;
use crate::protocol::FACE_BACKUP_NUM;
use crate::store::{within_debounce, FaceRow, Repository, UserSummary, MIN_ENROLL_ID};

#[derive(Debug, Clone)]
struct UserRow {
    name: String,
    is_admin: bool,
    record: String,
    is_active: bool,
}

#[derive(Debug, Clone)]
struct AttendanceRow {
    enroll_id: i64,
    #[allow(dead_code)]
    device_serial: String,
    punch_time: String,
}

#[derive(Default)]
struct Inner {
    // keyed by (enroll_id, backup_num)
    users: BTreeMap<(i64, i32), UserRow>,
    attendance: Vec<AttendanceRow>,
    last_allocated_id: i64,
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attendance rows recorded for a user (test hook).
    pub async fn attendance_count(&self, enroll_id: i64) -> usize {
        self.inner
            .lock()
            .await
            .attendance
            .iter()
            .filter(|row| row.enroll_id == enroll_id)
            .count()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn has_face_data(&self, enroll_id: i64) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .get(&(enroll_id, FACE_BACKUP_NUM))
            .map_or(false, |row| !row.record.is_empty()))
    }

    async fn upsert_user(
        &self,
        enroll_id: i64,
        name: &str,
        backup_num: i32,
        is_admin: bool,
        record: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let is_active = inner
            .users
            .get(&(enroll_id, backup_num))
            .map_or(true, |row| row.is_active);
        inner.users.insert(
            (enroll_id, backup_num),
            UserRow {
                name: name.to_string(),
                is_admin,
                record: record.to_string(),
                is_active,
            },
        );
        Ok(())
    }

    async fn delete_user(&self, enroll_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.users.retain(|&(id, _), _| id != enroll_id);
        Ok(())
    }

    async fn set_user_active(&self, enroll_id: i64, active: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (&(id, _), row) in inner.users.iter_mut() {
            if id == enroll_id {
                row.is_active = active;
            }
        }
        Ok(())
    }

    async fn log_attendance(&self, enroll_id: i64, device_serial: &str, time: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        let debounced = inner
            .attendance
            .iter()
            .rev()
            .find(|row| row.enroll_id == enroll_id)
            .map_or(false, |row| within_debounce(&row.punch_time, time));
        if debounced {
            return Ok(false);
        }

        inner.attendance.push(AttendanceRow {
            enroll_id,
            device_serial: device_serial.to_string(),
            punch_time: time.to_string(),
        });
        Ok(true)
    }

    async fn search_users_by_name(&self, fragment: &str) -> Result<Vec<UserSummary>> {
        let needle = fragment.to_lowercase();
        let inner = self.inner.lock().await;

        let mut seen = std::collections::HashSet::new();
        let mut results = Vec::new();
        for (&(id, _), row) in inner.users.iter() {
            if row.name.to_lowercase().contains(&needle) && seen.insert(id) {
                results.push(UserSummary {
                    enroll_id: id,
                    name: row.name.clone(),
                    is_active: row.is_active,
                });
            }
        }
        Ok(results)
    }

    async fn next_enroll_id(&self) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        let max_existing = inner.users.keys().map(|&(id, _)| id).max().unwrap_or(0);
        let next = (inner.last_allocated_id + 1)
            .max(max_existing + 1)
            .max(MIN_ENROLL_ID);
        inner.last_allocated_id = next;
        Ok(next)
    }

    async fn snapshot_active_face_users(&self) -> Result<HashMap<i64, bool>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .iter()
            .filter(|(&(_, backup), row)| backup == FACE_BACKUP_NUM && !row.record.is_empty())
            .map(|(&(id, _), row)| (id, row.is_active))
            .collect())
    }

    async fn fetch_face_row(&self, enroll_id: i64) -> Result<Option<FaceRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .get(&(enroll_id, FACE_BACKUP_NUM))
            .filter(|row| !row.record.is_empty())
            .map(|row| FaceRow {
                name: row.name.clone(),
                record: row.record.clone(),
                is_active: row.is_active,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn id_allocation_is_monotonic_and_floored() {
        let repo = MemoryRepository::new();
        assert_eq!(repo.next_enroll_id().await.unwrap(), 1000);
        assert_eq!(repo.next_enroll_id().await.unwrap(), 1001);

        repo.upsert_user(5000, "High", FACE_BACKUP_NUM, false, "img")
            .await
            .unwrap();
        assert_eq!(repo.next_enroll_id().await.unwrap(), 5001);
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        use std::sync::Arc;

        let repo = Arc::new(MemoryRepository::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move { repo.next_enroll_id().await.unwrap() }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn attendance_debounce_drops_near_duplicates() {
        let repo = MemoryRepository::new();
        assert!(repo
            .log_attendance(1000, "A1", "2026-08-02 09:00:00")
            .await
            .unwrap());
        assert!(!repo
            .log_attendance(1000, "A1", "2026-08-02 09:00:19")
            .await
            .unwrap());
        assert!(repo
            .log_attendance(1000, "A1", "2026-08-02 09:00:21")
            .await
            .unwrap());
        assert_eq!(repo.attendance_count(1000).await, 2);
    }

    #[tokio::test]
    async fn delete_purges_every_backup_slot(){
        let repo = MemoryRepository::new();
        repo.upsert_user(1000, "Ada", FACE_BACKUP_NUM, false, "img")
            .await
            .unwrap();
        repo.upsert_user(1000, "Ada", 0, false, "fp")
            .await
            .unwrap();

        repo.delete_user(1000).await.unwrap();
        assert!(!repo.has_face_data(1000).await.unwrap());
        assert!(repo.search_users_by_name("ada").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_substring() {
        let repo = MemoryRepository::new();
        repo.upsert_user(1000, "Ada Lovelace", FACE_BACKUP_NUM, false, "img")
            .await
            .unwrap();
        repo.upsert_user(1001, "Grace Hopper", FACE_BACKUP_NUM, false, "img")
            .await
            .unwrap();

        let hits = repo.search_users_by_name("LOVE").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].enroll_id, 1000);
    }

    #[tokio::test]
    async fn snapshot_skips_faceless_rows() {
        let repo = MemoryRepository::new();
        repo.upsert_user(1000, "Ada", FACE_BACKUP_NUM, false, "img")
            .await
            .unwrap();
        repo.upsert_user(1001, "NoFace", 0, false, "fp")
            .await
            .unwrap();

        let snapshot = repo.snapshot_active_face_users().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&1000));
    }
}
