//! Inbound frame dispatch. Every handler either replies on the originating
//! session or fans out through the session registry. Malformed frames are
//! dropped silently; unknown commands are logged and ignored.

use std::sync::Arc;

use serde_json::Value;

use crate::core::engine::{MatchResult, RecognitionEngine};
use crate::gallery::{Gallery, UserInfo};
use crate::protocol::{
    clean_log_cmd, clean_user_cmd, cloudtime_now, enroll_complete_frame, reg_ack,
    sendlog_reply, AdminAddUserCmd, AdminSearchCmd, AdminSetActiveCmd, AdminUserIdCmd,
    LiveScan, LivenessTelemetry, LogRecord, PingCmd, RegCmd, Reply, SendLogCmd, SendUserCmd,
    FACE_BACKUP_NUM, TIME_FORMAT,
};
use crate::service::enroll::{EnrollmentController, PendingEnrollment, ShotOutcome};
use crate::service::session::{SessionHandle, SessionRegistry, SessionRole};
use crate::store::Repository;

/// Device log records older than this are acknowledged without running the
/// recognition pipeline.
const LOG_STALE_SECS: i64 = 10;

pub struct Router {
    repo: Arc<dyn Repository>,
    gallery: Arc<Gallery>,
    engine: Arc<RecognitionEngine>,
    registry: Arc<SessionRegistry>,
    enroll: Arc<EnrollmentController>,
}

impl Router {
    pub fn new(
        repo: Arc<dyn Repository>,
        gallery: Arc<Gallery>,
        engine: Arc<RecognitionEngine>,
        registry: Arc<SessionRegistry>,
        enroll: Arc<EnrollmentController>,
    ) -> Self {
        Self {
            repo,
            gallery,
            engine,
            registry,
            enroll,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn enroll(&self) -> &Arc<EnrollmentController> {
        &self.enroll
    }

    pub async fn handle_frame(&self, session: &SessionHandle, role: &mut SessionRole, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let Some(cmd) = value.get("cmd").and_then(Value::as_str).map(str::to_owned) else {
            return;
        };

        match cmd.as_str() {
            "reg" => self.handle_reg(session, role, &value).await,
            "sendlog" => self.handle_sendlog(session, &value).await,
            "senduser" => self.handle_senduser(session, &value).await,
            "ping" | "admin_ping" => self.handle_ping(session, &value),
            "admin_hello" => self.handle_admin_hello(session, role).await,
            "admin_list_devices" => self.handle_list_devices(session).await,
            "admin_list_users" => self.handle_list_users(session).await,
            "admin_add_user" => self.handle_add_user(session, &value).await,
            "admin_delete_user" => self.handle_delete_user(session, &value).await,
            "admin_set_active" => self.handle_set_active(session, &value).await,
            "admin_get_user" => self.handle_get_user(session, &value).await,
            "admin_search_user_by_name" => self.handle_search_user(session, &value).await,
            other => {
                tracing::warn!(cmd = other, session = session.id, "unknown command");
            }
        }
    }

    // -----------------------------------------------------------------
    // Device commands

    async fn handle_reg(&self, session: &SessionHandle, role: &mut SessionRole, value: &Value) {
        let Some(cmd) = parse::<RegCmd>(value) else {
            return;
        };
        if cmd.sn.is_empty() {
            return;
        }

        *role = SessionRole::Device;
        self.registry.register_device(&cmd.sn, session.clone()).await;
        tracing::info!(serial = %cmd.sn, session = session.id, "device registered");
        session.send(&reg_ack());
    }

    async fn handle_sendlog(&self, session: &SessionHandle, value: &Value) {
        let Some(cmd) = parse::<SendLogCmd>(value) else {
            return;
        };

        for record in &cmd.record {
            self.handle_log_record(session, &cmd.sn, record).await;
        }
    }

    async fn handle_log_record(&self, session: &SessionHandle, serial: &str, record: &LogRecord) {
        if record_is_stale(record) {
            // Ack so the device flushes its offline backlog, then purge
            session.send(&sendlog_reply(0, "Log Expired"));
            session.send(&clean_log_cmd());
            return;
        }

        let note = record.note.as_ref().map(|n| n.msg.as_str()).unwrap_or("");
        if note.contains("system boot") {
            session.send(&sendlog_reply(0, "OK"));
            return;
        }
        if note.contains("fp verify fail") {
            session.send(&sendlog_reply(0, "Fingerprint Unavailable"));
            return;
        }

        match self.enroll.note_shot(serial, record.image.as_deref()).await {
            ShotOutcome::NoPending => {
                if note.contains("face not found") && record.image.is_some() {
                    self.handle_scan(session, serial, record).await;
                } else {
                    session.send(&sendlog_reply(0, "OK"));
                }
            }
            ShotOutcome::Ignored => {
                session.send(&sendlog_reply(0, "OK"));
            }
            ShotOutcome::Progress(entry) => {
                self.persist_shot(&entry).await;
                let message =
                    format!("Enrollment shot accepted, {} remaining", entry.shots_remaining);
                session.send(&sendlog_reply(0, &message));
            }
            ShotOutcome::Complete(entry) => {
                self.persist_shot(&entry).await;
                self.commit_enrollment(&entry).await;
                session.send(&sendlog_reply(0, "Enrollment Complete"));
                self.registry
                    .broadcast_to_operators(&enroll_complete_frame(
                        entry.enroll_id,
                        &entry.name,
                        serial,
                    ))
                    .await;
            }
            ShotOutcome::TimedOut(_) => {
                session.send(&clean_user_cmd());
                session.send(&clean_log_cmd());
                session.send(&sendlog_reply(0, "Enrollment Timeout"));
            }
        }
    }

    async fn persist_shot(&self, entry: &PendingEnrollment) {
        let Some(image) = entry.last_image.as_deref() else {
            return;
        };
        if let Err(e) = self
            .repo
            .upsert_user(
                entry.enroll_id,
                &entry.name,
                FACE_BACKUP_NUM,
                entry.is_admin,
                image,
            )
            .await
        {
            tracing::error!(enroll_id = entry.enroll_id, "failed to persist enrollment shot: {}", e);
        }
    }

    async fn commit_enrollment(&self, entry: &PendingEnrollment) {
        let Some(image) = entry.last_image.as_deref() else {
            return;
        };
        match self.engine.embed_bytes(image, false).await {
            Some(embedding) => {
                self.gallery
                    .upsert(entry.enroll_id, embedding, &entry.name, true)
                    .await;
            }
            None => {
                // The store row exists; the reconciler retries the embedding
                tracing::warn!(
                    enroll_id = entry.enroll_id,
                    "enrollment image produced no embedding, deferring to reconciler"
                );
            }
        }
    }

    async fn handle_scan(&self, session: &SessionHandle, serial: &str, record: &LogRecord) {
        let Some(image) = record.image.as_deref() else {
            return;
        };

        let result = self.engine.match_bytes(&self.gallery, image).await;
        let user = self.gallery.user(result.enroll_id).await;

        let (access, message) = match user.as_ref() {
            Some(user) if result.matched && user.is_active => (1, format!("Welcome {}", user.name)),
            Some(user) if result.matched => (0, format!("User inactive: {}", user.name)),
            _ => (0, "Access Denied".to_string()),
        };

        if access == 1 {
            if let Err(e) = self
                .repo
                .log_attendance(result.enroll_id, serial, &cloudtime_now())
                .await
            {
                tracing::error!(enroll_id = result.enroll_id, "failed to log attendance: {}", e);
            }
        }

        session.send(&sendlog_reply(access, &message));
        self.fan_out_scan(session, serial, &result, user.as_ref()).await;
    }

    async fn fan_out_scan(
        &self,
        session: &SessionHandle,
        serial: &str,
        result: &MatchResult,
        user: Option<&UserInfo>,
    ) {
        let liveness = if self.engine.recognize_with_liveness() {
            self.engine.latest_liveness().map(|r| LivenessTelemetry {
                score: r.score,
                prob: r.probability,
                time_ms: r.elapsed_ms,
            })
        } else {
            None
        };

        let scan = LiveScan {
            ret: "live_scan",
            device_sn: serial.to_string(),
            device_ip: session.peer.ip().to_string(),
            time: cloudtime_now(),
            matched: result.matched,
            match_score: result.score,
            enroll_id: result.enroll_id,
            user_name: user.map(|u| u.name.clone()).unwrap_or_default(),
            is_active: user.map(|u| u.is_active).unwrap_or(false),
            has_face: user.map(|u| u.has_face).unwrap_or(false),
            liveness,
        };

        match serde_json::to_value(&scan) {
            Ok(frame) => self.registry.broadcast_to_operators(&frame).await,
            Err(e) => tracing::error!("failed to serialize live_scan: {}", e),
        }
    }

    async fn handle_senduser(&self, session: &SessionHandle, value: &Value) {
        let Some(cmd) = parse::<SendUserCmd>(value) else {
            return;
        };

        // Legacy path: the server always allocates a fresh id and ignores
        // the one the device sent.
        let enroll_id = match self.repo.next_enroll_id().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("id allocation failed: {}", e);
                session.send(&Reply::fail("senduser", "store error").into_value());
                return;
            }
        };

        if let Err(e) = self
            .repo
            .upsert_user(enroll_id, &cmd.name, cmd.backupnum, cmd.admin != 0, &cmd.record)
            .await
        {
            tracing::error!(enroll_id, "failed to store user: {}", e);
            session.send(&Reply::fail("senduser", "store error").into_value());
            return;
        }

        if cmd.backupnum == FACE_BACKUP_NUM && !cmd.record.is_empty() {
            match self.engine.embed_bytes(&cmd.record, false).await {
                Some(embedding) => {
                    self.gallery
                        .upsert(enroll_id, embedding, &cmd.name, true)
                        .await;
                }
                None => {
                    tracing::warn!(enroll_id, "senduser face record produced no embedding");
                }
            }
        }

        session.send(
            &Reply::ok("senduser")
                .field("enrollid", enroll_id)
                .field("cloudtime", cloudtime_now())
                .into_value(),
        );
    }

    fn handle_ping(&self, session: &SessionHandle, value: &Value) {
        let ts = parse::<PingCmd>(value).map(|p| p.ts).unwrap_or_default();
        session.send(&Reply::ok("pong").field("ts", ts).into_value());
    }

    // -----------------------------------------------------------------
    // Operator commands

    async fn handle_admin_hello(&self, session: &SessionHandle, role: &mut SessionRole) {
        *role = SessionRole::Operator;
        self.registry.register_operator(session.clone()).await;

        let serials = self.registry.list_device_serials().await;
        session.send(
            &Reply::ok("admin_hello")
                .field("message", "connected")
                .field("deviceCount", serials.len())
                .into_value(),
        );

        // Devices re-learn their registration state through a fresh ack
        for device in self.registry.device_handles().await {
            device.send(&reg_ack());
        }
    }

    async fn handle_list_devices(&self, session: &SessionHandle) {
        let serials = self.registry.list_device_serials().await;
        session.send(
            &Reply::ok("admin_list_devices")
                .field("devices", serials)
                .into_value(),
        );
    }

    async fn handle_list_users(&self, session: &SessionHandle) {
        let mut users: Vec<_> = self.gallery.users().await.into_values().collect();
        users.sort_by_key(|u| u.enroll_id);

        let users: Vec<Value> = users
            .into_iter()
            .map(|u| {
                serde_json::json!({
                    "enrollId": u.enroll_id,
                    "name": u.name,
                    "isActive": u.is_active,
                    "hasFace": u.has_face,
                })
            })
            .collect();

        session.send(&Reply::ok("admin_list_users").field("users", users).into_value());
    }

    async fn handle_add_user(&self, session: &SessionHandle, value: &Value) {
        const RET: &str = "admin_add_user";
        let Some(cmd) = parse::<AdminAddUserCmd>(value) else {
            session.send(&Reply::fail(RET, "invalid arguments").into_value());
            return;
        };

        if !self.registry.is_device_connected(&cmd.device_sn).await {
            session.send(&Reply::fail(RET, "device not connected").into_value());
            return;
        }
        if self.enroll.is_pending(&cmd.device_sn).await {
            session.send(
                &Reply::fail(RET, "enrollment already in progress for this device").into_value(),
            );
            return;
        }

        let enroll_id = match self.repo.next_enroll_id().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("id allocation failed: {}", e);
                session.send(&Reply::fail(RET, "store error").into_value());
                return;
            }
        };

        match self.repo.has_face_data(enroll_id).await {
            Ok(true) => {
                session.send(&Reply::fail(RET, "user already has face data").into_value());
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(enroll_id, "face-data lookup failed: {}", e);
                session.send(&Reply::fail(RET, "store error").into_value());
                return;
            }
        }

        if let Err(reason) = self
            .enroll
            .begin(&cmd.device_sn, enroll_id, &cmd.name, cmd.is_admin != 0)
            .await
        {
            session.send(&Reply::fail(RET, reason).into_value());
            return;
        }

        session.send(
            &Reply::ok(RET)
                .field("enrollId", enroll_id)
                .field("name", cmd.name.clone())
                .field("deviceSn", cmd.device_sn.clone())
                .into_value(),
        );
    }

    async fn handle_delete_user(&self, session: &SessionHandle, value: &Value) {
        const RET: &str = "admin_delete_user";
        let Some(cmd) = parse::<AdminUserIdCmd>(value) else {
            session.send(&Reply::fail(RET, "invalid arguments").into_value());
            return;
        };
        if cmd.enroll_id <= 0 {
            session.send(&Reply::fail(RET, "invalid enroll id").into_value());
            return;
        }

        if let Err(e) = self.repo.delete_user(cmd.enroll_id).await {
            tracing::error!(enroll_id = cmd.enroll_id, "delete failed: {}", e);
            session.send(&Reply::fail(RET, "store error").into_value());
            return;
        }
        self.gallery.remove(cmd.enroll_id).await;

        session.send(&Reply::ok(RET).field("enrollId", cmd.enroll_id).into_value());
    }

    async fn handle_set_active(&self, session: &SessionHandle, value: &Value) {
        const RET: &str = "admin_set_active";
        let Some(cmd) = parse::<AdminSetActiveCmd>(value) else {
            session.send(&Reply::fail(RET, "invalid arguments").into_value());
            return;
        };
        if cmd.enroll_id <= 0 {
            session.send(&Reply::fail(RET, "invalid enroll id").into_value());
            return;
        }

        if let Err(e) = self.repo.set_user_active(cmd.enroll_id, cmd.active).await {
            tracing::error!(enroll_id = cmd.enroll_id, "set active failed: {}", e);
            session.send(&Reply::fail(RET, "store error").into_value());
            return;
        }
        self.gallery.set_active(cmd.enroll_id, cmd.active).await;

        session.send(
            &Reply::ok(RET)
                .field("enrollId", cmd.enroll_id)
                .field("active", cmd.active)
                .into_value(),
        );
    }

    async fn handle_get_user(&self, session: &SessionHandle, value: &Value) {
        const RET: &str = "admin_get_user";
        let Some(cmd) = parse::<AdminUserIdCmd>(value) else {
            session.send(&Reply::fail(RET, "invalid arguments").into_value());
            return;
        };

        match self.gallery.user(cmd.enroll_id).await {
            Some(user) => session.send(
                &Reply::ok(RET)
                    .field("enrollId", user.enroll_id)
                    .field("name", user.name)
                    .field("isActive", user.is_active)
                    .field("hasFace", user.has_face)
                    .into_value(),
            ),
            None => session.send(&Reply::fail(RET, "user not found").into_value()),
        };
    }

    async fn handle_search_user(&self, session: &SessionHandle, value: &Value) {
        const RET: &str = "admin_search_user_by_name";
        let Some(cmd) = parse::<AdminSearchCmd>(value) else {
            session.send(&Reply::fail(RET, "invalid arguments").into_value());
            return;
        };

        match self.repo.search_users_by_name(&cmd.name).await {
            Ok(results) => {
                let users: Vec<Value> = results
                    .into_iter()
                    .map(|u| {
                        serde_json::json!({
                            "enrollId": u.enroll_id,
                            "name": u.name,
                            "isActive": u.is_active,
                        })
                    })
                    .collect();
                session.send(&Reply::ok(RET).field("users", users).into_value());
            }
            Err(e) => {
                tracing::error!("user search failed: {}", e);
                session.send(&Reply::fail(RET, "store error").into_value());
            }
        }
    }

    /// Device teardown: unbind the session and cancel any enrollment it was
    /// driving.
    pub async fn handle_disconnect(&self, session_id: u64) {
        if let Some(serial) = self.registry.unregister(session_id).await {
            self.enroll.cancel(&serial).await;
        }
    }

    /// Shutdown drain: tell every device to purge partial state, then close
    /// every session.
    pub async fn drain_sessions(&self) {
        for device in self.registry.device_handles().await {
            device.send(&clean_log_cmd());
            device.send(&clean_user_cmd());
            device.close();
        }
        for operator in self.registry.operator_handles().await {
            operator.close();
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
    serde_json::from_value(value.clone()).ok()
}

fn record_is_stale(record: &LogRecord) -> bool {
    let Ok(time) = chrono::NaiveDateTime::parse_from_str(&record.time, TIME_FORMAT) else {
        return false;
    };
    let age = chrono::Local::now().naive_local() - time;
    age.num_seconds() > LOG_STALE_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_record_is_not_stale() {
        let record = LogRecord {
            enrollid: 0,
            time: chrono::Local::now().format(TIME_FORMAT).to_string(),
            note: None,
            image: None,
        };
        assert!(!record_is_stale(&record));
    }

    #[test]
    fn old_record_is_stale() {
        let time = chrono::Local::now() - chrono::Duration::seconds(30);
        let record = LogRecord {
            enrollid: 0,
            time: time.format(TIME_FORMAT).to_string(),
            note: None,
            image: None,
        };
        assert!(record_is_stale(&record));
    }

    #[test]
    fn unparseable_time_is_processed_normally() {
        let record = LogRecord {
            enrollid: 0,
            time: "garbage".to_string(),
            note: None,
            image: None,
        };
        assert!(!record_is_stale(&record));
    }
}
