//! End-to-end flows through the router: enrollment, recognition, session
//! dedup, reconciliation. The store is the in-memory repository and the
//! networks are stubbed; sessions are backed by plain channels.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use facegate::common::config::{EnrollmentConfig, ReconcileConfig, RecognitionConfig};
use facegate::common::error::Result;
use facegate::core::detector::FaceBox;
use facegate::core::{Inference, RecognitionEngine};
use facegate::gallery::Gallery;
use facegate::protocol::{TIME_FORMAT, FACE_BACKUP_NUM};
use facegate::service::{
    EnrollmentController, Reconciler, Router, SessionHandle, SessionRegistry, SessionRole,
};
use facegate::store::{MemoryRepository, Repository};

/// Stub networks: one full-frame face, always-live, and an embedding equal
/// to the crop's mean color. Distinct solid colors embed to orthogonal
/// vectors, so matching behaves predictably.
struct StubInference;

impl Inference for StubInference {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        Ok(vec![FaceBox {
            x1: 0.0,
            y1: 0.0,
            x2: image.width() as f32,
            y2: image.height() as f32,
            confidence: 0.95,
        }])
    }

    fn spoof_scores(&self, _crop: &DynamicImage) -> Result<Vec<f32>> {
        Ok(vec![0.0, 5.0])
    }

    fn embed(&self, face: &DynamicImage) -> Result<Vec<f32>> {
        let rgb = face.to_rgb8();
        let mut sums = [0.0f32; 3];
        for pixel in rgb.pixels() {
            for c in 0..3 {
                sums[c] += pixel[c] as f32;
            }
        }
        let count = (rgb.width() * rgb.height()) as f32;
        Ok(sums.iter().map(|s| s / count / 255.0).collect())
    }
}

fn solid_image_b64(color: [u8; 3]) -> String {
    let image = RgbImage::from_pixel(64, 64, Rgb(color));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageOutputFormat::Png,
        )
        .unwrap();
    STANDARD.encode(&bytes)
}

const RED: [u8; 3] = [255, 0, 0];
const GREEN: [u8; 3] = [0, 255, 0];

struct Harness {
    repo: Arc<MemoryRepository>,
    gallery: Arc<Gallery>,
    engine: Arc<RecognitionEngine>,
    registry: Arc<SessionRegistry>,
    router: Router,
}

impl Harness {
    fn new() -> Self {
        Self::with_enrollment(EnrollmentConfig::default())
    }

    fn with_enrollment(enrollment: EnrollmentConfig) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let gallery = Arc::new(Gallery::new());
        let engine = Arc::new(RecognitionEngine::new(
            Box::new(StubInference),
            RecognitionConfig::default(),
        ));
        let registry = Arc::new(SessionRegistry::new());
        let enroll = Arc::new(EnrollmentController::new(&enrollment));
        let router = Router::new(
            repo.clone() as Arc<dyn Repository>,
            gallery.clone(),
            engine.clone(),
            registry.clone(),
            enroll,
        );
        Self {
            repo,
            gallery,
            engine,
            registry,
            router,
        }
    }

    fn session(&self) -> (SessionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer: SocketAddr = "10.0.0.7:40000".parse().unwrap();
        (
            SessionHandle::new(self.registry.allocate_session_id(), peer, tx),
            rx,
        )
    }

    async fn send(&self, session: &SessionHandle, role: &mut SessionRole, frame: Value) {
        self.router
            .handle_frame(session, role, &frame.to_string())
            .await;
    }
}

fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
    match rx.try_recv() {
        Ok(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

fn assert_no_frame(rx: &mut mpsc::UnboundedReceiver<Message>) {
    assert!(rx.try_recv().is_err(), "unexpected frame queued");
}

fn now_str() -> String {
    chrono::Local::now().format(TIME_FORMAT).to_string()
}

fn scan_frame(sn: &str, time: &str, msg: &str, image: Option<&str>) -> Value {
    let mut record = json!({
        "enrollid": 0,
        "time": time,
        "note": { "msg": msg },
    });
    if let Some(image) = image {
        record["image"] = Value::String(image.to_string());
    }
    json!({ "cmd": "sendlog", "sn": sn, "record": [record] })
}

async fn register_device(h: &Harness, sn: &str) -> (SessionHandle, mpsc::UnboundedReceiver<Message>) {
    let (session, mut rx) = h.session();
    let mut role = SessionRole::Unknown;
    h.send(&session, &mut role, json!({ "cmd": "reg", "sn": sn })).await;

    let ack = next_json(&mut rx);
    assert_eq!(ack["ret"], "reg");
    assert_eq!(ack["result"], true);
    assert_eq!(ack["nosenduser"], false);
    assert!(ack["cloudtime"].is_string());

    (session, rx)
}

async fn register_operator(h: &Harness) -> (SessionHandle, mpsc::UnboundedReceiver<Message>) {
    let (session, mut rx) = h.session();
    let mut role = SessionRole::Unknown;
    h.send(&session, &mut role, json!({ "cmd": "admin_hello" })).await;

    let greeting = next_json(&mut rx);
    assert_eq!(greeting["ret"], "admin_hello");
    assert_eq!(greeting["result"], true);

    (session, rx)
}

#[tokio::test]
async fn s1_happy_enrollment() {
    let h = Harness::new();
    let (device, mut device_rx) = register_device(&h, "A").await;
    let (operator, mut operator_rx) = register_operator(&h).await;

    // The reg ack was re-sent to the device when the operator connected
    let resent = next_json(&mut device_rx);
    assert_eq!(resent["ret"], "reg");

    let mut op_role = SessionRole::Operator;
    h.send(
        &operator,
        &mut op_role,
        json!({ "cmd": "admin_add_user", "deviceSn": "A", "name": "Ada", "isAdmin": 0 }),
    )
    .await;

    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["ret"], "admin_add_user");
    assert_eq!(reply["result"], true);
    assert_eq!(reply["enrollId"], 1000);

    // Two shots complete the enrollment
    let mut dev_role = SessionRole::Device;
    h.send(
        &device,
        &mut dev_role,
        scan_frame("A", &now_str(), "face not found", Some(&solid_image_b64(RED))),
    )
    .await;
    let first = next_json(&mut device_rx);
    assert_eq!(first["ret"], "sendlog");
    assert_eq!(first["access"], 0);

    h.send(
        &device,
        &mut dev_role,
        scan_frame("A", &now_str(), "face not found", Some(&solid_image_b64(RED))),
    )
    .await;
    let second = next_json(&mut device_rx);
    assert_eq!(second["access"], 0);
    assert_eq!(second["message"], "Enrollment Complete");

    let broadcast = next_json(&mut operator_rx);
    assert_eq!(broadcast["ret"], "admin_enroll_complete");
    assert_eq!(broadcast["enrollId"], 1000);
    assert_eq!(broadcast["username"], "Ada");
    assert_eq!(broadcast["deviceSn"], "A");

    assert!(h.repo.has_face_data(1000).await.unwrap());
    assert!(h.gallery.user(1000).await.is_some());
}

#[tokio::test]
async fn s2_recognition_of_active_user_grants_access() {
    let h = Harness::new();
    let (device, mut device_rx) = register_device(&h, "A").await;
    let (_operator, mut operator_rx) = register_operator(&h).await;
    let _ = next_json(&mut device_rx); // re-sent reg ack

    let red = h
        .engine
        .embed_bytes(&solid_image_b64(RED), false)
        .await
        .unwrap();
    h.gallery.upsert(1000, red, "Ada", true).await;

    let mut role = SessionRole::Device;
    h.send(
        &device,
        &mut role,
        scan_frame("A", &now_str(), "face not found", Some(&solid_image_b64(RED))),
    )
    .await;

    let reply = next_json(&mut device_rx);
    assert_eq!(reply["access"], 1);
    assert_eq!(reply["message"], "Welcome Ada");
    assert_eq!(h.repo.attendance_count(1000).await, 1);

    let scan = next_json(&mut operator_rx);
    assert_eq!(scan["ret"], "live_scan");
    assert_eq!(scan["matched"], true);
    assert_eq!(scan["enrollId"], 1000);
    assert_eq!(scan["userName"], "Ada");
    assert_eq!(scan["isActive"], true);
    assert!(scan["liveness"].is_object());
}

#[tokio::test]
async fn s3_recognition_of_inactive_user_is_denied() {
    let h = Harness::new();
    let (device, mut device_rx) = register_device(&h, "A").await;

    let red = h
        .engine
        .embed_bytes(&solid_image_b64(RED), false)
        .await
        .unwrap();
    h.gallery.upsert(1000, red, "Ada", false).await;

    let mut role = SessionRole::Device;
    h.send(
        &device,
        &mut role,
        scan_frame("A", &now_str(), "face not found", Some(&solid_image_b64(RED))),
    )
    .await;

    let reply = next_json(&mut device_rx);
    assert_eq!(reply["access"], 0);
    assert_eq!(reply["message"], "User inactive: Ada");
    assert_eq!(h.repo.attendance_count(1000).await, 0);
}

#[tokio::test]
async fn unknown_probe_is_denied() {
    let h = Harness::new();
    let (device, mut device_rx) = register_device(&h, "A").await;

    let red = h
        .engine
        .embed_bytes(&solid_image_b64(RED), false)
        .await
        .unwrap();
    h.gallery.upsert(1000, red, "Ada", true).await;

    let mut role = SessionRole::Device;
    h.send(
        &device,
        &mut role,
        scan_frame("A", &now_str(), "face not found", Some(&solid_image_b64(GREEN))),
    )
    .await;

    let reply = next_json(&mut device_rx);
    assert_eq!(reply["access"], 0);
    assert_eq!(reply["message"], "Access Denied");
    assert_eq!(h.repo.attendance_count(1000).await, 0);
}

#[tokio::test]
async fn s4_s5_reconciliation_adds_and_evicts() {
    let h = Harness::new();
    let reconciler = Reconciler::new(
        h.repo.clone() as Arc<dyn Repository>,
        h.gallery.clone(),
        h.engine.clone(),
        &ReconcileConfig::default(),
    );

    // S4: a store row the gallery has never seen
    h.repo
        .upsert_user(1001, "Grace", FACE_BACKUP_NUM, false, &solid_image_b64(GREEN))
        .await
        .unwrap();
    reconciler.run_cycle().await.unwrap();
    assert!(h.gallery.user(1001).await.is_some());

    let probe = h
        .engine
        .embed_bytes(&solid_image_b64(GREEN), false)
        .await
        .unwrap();
    let (id, score) = h.gallery.best_match(&probe).await.unwrap();
    assert_eq!(id, 1001);
    assert!(score > 0.9);

    // Active-flag sync
    h.repo.set_user_active(1001, false).await.unwrap();
    reconciler.run_cycle().await.unwrap();
    assert!(!h.gallery.user(1001).await.unwrap().is_active);

    // S5: the store row disappears, the gallery follows
    h.repo.delete_user(1001).await.unwrap();
    reconciler.run_cycle().await.unwrap();
    assert!(h.gallery.user(1001).await.is_none());
    assert!(h.gallery.best_match(&probe).await.is_none());
}

#[tokio::test]
async fn s6_reconnecting_device_supersedes_prior_session() {
    let h = Harness::new();
    let (_first, mut first_rx) = register_device(&h, "A").await;
    let (_second, _second_rx) = register_device(&h, "A").await;

    // First session observes closure
    match first_rx.try_recv() {
        Ok(Message::Close(_)) => {}
        other => panic!("expected close, got {:?}", other),
    }

    assert!(h.registry.is_device_connected("A").await);
    assert_eq!(h.registry.list_device_serials().await, vec!["A".to_string()]);
}

#[tokio::test]
async fn ping_echoes_timestamp_once() {
    let h = Harness::new();
    let (session, mut rx) = h.session();
    let mut role = SessionRole::Unknown;

    h.send(&session, &mut role, json!({ "cmd": "ping", "ts": 123456 })).await;

    let pong = next_json(&mut rx);
    assert_eq!(pong["ret"], "pong");
    assert_eq!(pong["ts"], 123456);
    assert_no_frame(&mut rx);
}

#[tokio::test]
async fn stale_log_is_acked_and_purged_without_matching() {
    let h = Harness::new();
    let (device, mut device_rx) = register_device(&h, "A").await;
    let (_operator, mut operator_rx) = register_operator(&h).await;
    let _ = next_json(&mut device_rx); // re-sent reg ack

    let old = (chrono::Local::now() - chrono::Duration::seconds(30))
        .format(TIME_FORMAT)
        .to_string();
    let mut role = SessionRole::Device;
    h.send(
        &device,
        &mut role,
        scan_frame("A", &old, "face not found", Some(&solid_image_b64(RED))),
    )
    .await;

    let reply = next_json(&mut device_rx);
    assert_eq!(reply["ret"], "sendlog");
    assert_eq!(reply["message"], "Log Expired");

    let purge = next_json(&mut device_rx);
    assert_eq!(purge["cmd"], "cleanlog");

    // The pipeline never ran, so no telemetry reached the operator
    assert_no_frame(&mut operator_rx);
}

#[tokio::test]
async fn boot_and_fingerprint_notes_short_circuit() {
    let h = Harness::new();
    let (device, mut device_rx) = register_device(&h, "A").await;

    let mut role = SessionRole::Device;
    h.send(&device, &mut role, scan_frame("A", &now_str(), "system boot", None)).await;
    let reply = next_json(&mut device_rx);
    assert_eq!(reply["message"], "OK");

    h.send(&device, &mut role, scan_frame("A", &now_str(), "fp verify fail", None)).await;
    let reply = next_json(&mut device_rx);
    assert_eq!(reply["access"], 0);
    assert_eq!(reply["message"], "Fingerprint Unavailable");
}

#[tokio::test]
async fn enrollment_timeout_purges_device_state() {
    let h = Harness::with_enrollment(EnrollmentConfig {
        shots_required: 2,
        timeout_secs: 0,
    });
    let (device, mut device_rx) = register_device(&h, "A").await;
    let (operator, mut operator_rx) = register_operator(&h).await;
    let _ = next_json(&mut device_rx); // re-sent reg ack

    let mut op_role = SessionRole::Operator;
    h.send(
        &operator,
        &mut op_role,
        json!({ "cmd": "admin_add_user", "deviceSn": "A", "name": "Ada", "isAdmin": 0 }),
    )
    .await;
    assert_eq!(next_json(&mut operator_rx)["result"], true);

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let mut dev_role = SessionRole::Device;
    h.send(
        &device,
        &mut dev_role,
        scan_frame("A", &now_str(), "face not found", Some(&solid_image_b64(RED))),
    )
    .await;

    let cleanuser = next_json(&mut device_rx);
    assert_eq!(cleanuser["cmd"], "cleanuser");
    let cleanlog = next_json(&mut device_rx);
    assert_eq!(cleanlog["cmd"], "cleanlog");
    let reply = next_json(&mut device_rx);
    assert_eq!(reply["message"], "Enrollment Timeout");
}

#[tokio::test]
async fn device_disconnect_cancels_pending_enrollment() {
    let h = Harness::new();
    let (device, _device_rx) = register_device(&h, "A").await;
    let (operator, mut operator_rx) = register_operator(&h).await;

    let mut op_role = SessionRole::Operator;
    h.send(
        &operator,
        &mut op_role,
        json!({ "cmd": "admin_add_user", "deviceSn": "A", "name": "Ada", "isAdmin": 0 }),
    )
    .await;
    assert_eq!(next_json(&mut operator_rx)["result"], true);

    h.router.handle_disconnect(device.id).await;

    assert!(!h.registry.is_device_connected("A").await);
    assert!(!h.router.enroll().is_pending("A").await);
}

#[tokio::test]
async fn add_user_preconditions_fail_with_distinct_reasons() {
    let h = Harness::new();
    let (operator, mut operator_rx) = register_operator(&h).await;
    let mut op_role = SessionRole::Operator;

    // Device not connected
    h.send(
        &operator,
        &mut op_role,
        json!({ "cmd": "admin_add_user", "deviceSn": "X", "name": "Ada", "isAdmin": 0 }),
    )
    .await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["result"], false);
    assert_eq!(reply["error"], "device not connected");

    // Duplicate enrollment on the same device
    let (_device, _device_rx) = register_device(&h, "A").await;
    h.send(
        &operator,
        &mut op_role,
        json!({ "cmd": "admin_add_user", "deviceSn": "A", "name": "Ada", "isAdmin": 0 }),
    )
    .await;
    assert_eq!(next_json(&mut operator_rx)["result"], true);

    h.send(
        &operator,
        &mut op_role,
        json!({ "cmd": "admin_add_user", "deviceSn": "A", "name": "Grace", "isAdmin": 0 }),
    )
    .await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["result"], false);
    assert_eq!(
        reply["error"],
        "enrollment already in progress for this device"
    );
}

#[tokio::test]
async fn senduser_regenerates_the_enrollment_id() {
    let h = Harness::new();
    let (device, mut device_rx) = register_device(&h, "A").await;

    let mut role = SessionRole::Device;
    h.send(
        &device,
        &mut role,
        json!({
            "cmd": "senduser",
            "sn": "A",
            "enrollid": 7,
            "backupnum": 50,
            "name": "Ada",
            "admin": 0,
            "record": solid_image_b64(RED),
        }),
    )
    .await;

    let reply = next_json(&mut device_rx);
    assert_eq!(reply["ret"], "senduser");
    assert_eq!(reply["result"], true);
    // The device-sent id is ignored; a fresh one is allocated
    assert_eq!(reply["enrollid"], 1000);
    assert!(h.gallery.user(1000).await.is_some());
    assert!(h.repo.has_face_data(1000).await.unwrap());
}

#[tokio::test]
async fn admin_queries_cover_roster_and_search() {
    let h = Harness::new();
    let (operator, mut operator_rx) = register_operator(&h).await;
    let mut op_role = SessionRole::Operator;

    let red = h
        .engine
        .embed_bytes(&solid_image_b64(RED), false)
        .await
        .unwrap();
    h.gallery.upsert(1000, red, "Ada Lovelace", true).await;
    h.repo
        .upsert_user(1000, "Ada Lovelace", FACE_BACKUP_NUM, false, "img")
        .await
        .unwrap();

    h.send(&operator, &mut op_role, json!({ "cmd": "admin_get_user", "enrollId": 1000 })).await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["result"], true);
    assert_eq!(reply["name"], "Ada Lovelace");
    assert_eq!(reply["hasFace"], true);

    h.send(&operator, &mut op_role, json!({ "cmd": "admin_get_user", "enrollId": 42 })).await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["result"], false);
    assert_eq!(reply["error"], "user not found");

    h.send(
        &operator,
        &mut op_role,
        json!({ "cmd": "admin_search_user_by_name", "name": "love" }),
    )
    .await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["result"], true);
    assert_eq!(reply["users"][0]["enrollId"], 1000);

    h.send(&operator, &mut op_role, json!({ "cmd": "admin_list_users" })).await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["users"][0]["name"], "Ada Lovelace");

    h.send(&operator, &mut op_role, json!({ "cmd": "admin_set_active", "enrollId": 1000, "active": false })).await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["result"], true);
    assert!(!h.gallery.user(1000).await.unwrap().is_active);

    h.send(&operator, &mut op_role, json!({ "cmd": "admin_delete_user", "enrollId": 1000 })).await;
    let reply = next_json(&mut operator_rx);
    assert_eq!(reply["result"], true);
    assert!(h.gallery.user(1000).await.is_none());
    assert!(!h.repo.has_face_data(1000).await.unwrap());
}

#[tokio::test]
async fn malformed_frames_are_dropped_silently() {
    let h = Harness::new();
    let (session, mut rx) = h.session();
    let mut role = SessionRole::Unknown;

    h.router.handle_frame(&session, &mut role, "not json at all").await;
    h.send(&session, &mut role, json!({ "no_cmd": true })).await;
    h.send(&session, &mut role, json!({ "cmd": "no_such_command" })).await;

    assert_no_frame(&mut rx);
}
