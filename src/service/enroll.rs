//! Per-device enrollment state machine. Each enrollment spans several
//! device-initiated round-trips, so the server keeps one pending entry per
//! serial and advances it as log frames arrive. The wall-clock bound is
//! evaluated lazily on the next inbound frame.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::common::config::EnrollmentConfig;

#[derive(Debug, Clone)]
pub struct PendingEnrollment {
    pub enroll_id: i64,
    pub name: String,
    pub is_admin: bool,
    pub shots_remaining: u32,
    pub started_at: Instant,
    /// Most recent shot, committed to the gallery on completion.
    pub last_image: Option<String>,
}

/// Result of feeding one device log frame into the machine.
#[derive(Debug, Clone)]
pub enum ShotOutcome {
    /// No enrollment pending for this device.
    NoPending,
    /// Frame carried no image; the machine does not advance.
    Ignored,
    /// Shot accepted, more required.
    Progress(PendingEnrollment),
    /// Final shot accepted; the entry has been removed.
    Complete(PendingEnrollment),
    /// Deadline exceeded; the entry has been removed.
    TimedOut(PendingEnrollment),
}

pub struct EnrollmentController {
    pending: Mutex<HashMap<String, PendingEnrollment>>,
    shots_required: u32,
    timeout: Duration,
}

impl EnrollmentController {
    pub fn new(config: &EnrollmentConfig) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            shots_required: config.shots_required,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Begin collecting shots for a device. Fails when an enrollment is
    /// already pending for the serial; the router checks the other
    /// preconditions (device connected, id not already enrolled).
    pub async fn begin(
        &self,
        serial: &str,
        enroll_id: i64,
        name: &str,
        is_admin: bool,
    ) -> std::result::Result<(), &'static str> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(serial) {
            return Err("enrollment already in progress for this device");
        }

        pending.insert(
            serial.to_string(),
            PendingEnrollment {
                enroll_id,
                name: name.to_string(),
                is_admin,
                shots_remaining: self.shots_required,
                started_at: Instant::now(),
                last_image: None,
            },
        );
        tracing::info!(serial, enroll_id, name, "enrollment started");
        Ok(())
    }

    pub async fn is_pending(&self, serial: &str) -> bool {
        self.pending.lock().await.contains_key(serial)
    }

    /// Feed one inbound log frame into the machine.
    pub async fn note_shot(&self, serial: &str, image: Option<&str>) -> ShotOutcome {
        let mut pending = self.pending.lock().await;

        let Some(entry) = pending.get_mut(serial) else {
            return ShotOutcome::NoPending;
        };

        if entry.started_at.elapsed() > self.timeout {
            return match pending.remove(serial) {
                Some(entry) => {
                    tracing::info!(serial, enroll_id = entry.enroll_id, "enrollment timed out");
                    ShotOutcome::TimedOut(entry)
                }
                None => ShotOutcome::NoPending,
            };
        }

        let Some(image) = image else {
            return ShotOutcome::Ignored;
        };

        entry.last_image = Some(image.to_string());
        entry.shots_remaining = entry.shots_remaining.saturating_sub(1);

        if entry.shots_remaining == 0 {
            return match pending.remove(serial) {
                Some(entry) => {
                    tracing::info!(serial, enroll_id = entry.enroll_id, "enrollment complete");
                    ShotOutcome::Complete(entry)
                }
                None => ShotOutcome::NoPending,
            };
        }
        ShotOutcome::Progress(entry.clone())
    }

    /// Drop any pending enrollment for the serial (device disconnect).
    pub async fn cancel(&self, serial: &str) -> Option<PendingEnrollment> {
        let removed = self.pending.lock().await.remove(serial);
        if let Some(entry) = &removed {
            tracing::info!(serial, enroll_id = entry.enroll_id, "enrollment cancelled");
        }
        removed
    }
}
