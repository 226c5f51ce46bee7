//! Periodic reconciliation between the durable store and the in-memory
//! gallery: new face rows are embedded and added, active flags are synced,
//! rows deleted from the store are evicted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::common::config::ReconcileConfig;
use crate::common::error::Result;
use crate::core::engine::RecognitionEngine;
use crate::gallery::Gallery;
use crate::store::Repository;

pub struct Reconciler {
    repo: Arc<dyn Repository>,
    gallery: Arc<Gallery>,
    engine: Arc<RecognitionEngine>,
    interval: Duration,
    query_timeout: Duration,
    // Non-reentrancy gate: a tick that finds a cycle in flight is dropped
    gate: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn Repository>,
        gallery: Arc<Gallery>,
        engine: Arc<RecognitionEngine>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            repo,
            gallery,
            engine,
            interval: Duration::from_secs(config.interval_secs),
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            gate: Mutex::new(()),
        }
    }

    /// Run until the shutdown signal flips. Attached to the server's
    /// lifecycle; errors abort a cycle, never the task.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!("reconciliation cycle aborted: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("reconciler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation cycle. Skips silently when a prior cycle is still
    /// executing or the light snapshot times out.
    pub async fn run_cycle(&self) -> Result<()> {
        let Ok(_guard) = self.gate.try_lock() else {
            tracing::debug!("reconciliation already in flight, dropping tick");
            return Ok(());
        };

        let snapshot =
            match tokio::time::timeout(self.query_timeout, self.repo.snapshot_active_face_users())
                .await
            {
                Err(_) => {
                    tracing::debug!("store snapshot timed out, skipping cycle");
                    return Ok(());
                }
                Ok(result) => result?,
            };

        let gallery_ids = self.gallery.ids().await;
        let gallery_users = self.gallery.users().await;

        // Additions: store rows the gallery has never seen
        for (&enroll_id, &is_active) in &snapshot {
            if gallery_ids.contains(&enroll_id) {
                continue;
            }
            let Some(row) = self.repo.fetch_face_row(enroll_id).await? else {
                continue;
            };
            match self.engine.embed_bytes(&row.record, false).await {
                Some(embedding) => {
                    self.gallery
                        .upsert(enroll_id, embedding, &row.name, is_active)
                        .await;
                    tracing::info!(enroll_id, name = %row.name, "reconciler added user");
                }
                None => {
                    tracing::debug!(enroll_id, "stored face row produced no embedding");
                }
            }
        }

        // Active-flag updates
        for (&enroll_id, &is_active) in &snapshot {
            if let Some(user) = gallery_users.get(&enroll_id) {
                if user.is_active != is_active {
                    self.gallery.set_active(enroll_id, is_active).await;
                    tracing::info!(enroll_id, is_active, "reconciler updated active flag");
                }
            }
        }

        // Evictions: gallery entries the store no longer has
        for enroll_id in gallery_ids {
            if !snapshot.contains_key(&enroll_id) {
                self.gallery.remove(enroll_id).await;
                tracing::info!(enroll_id, "reconciler evicted user");
            }
        }

        Ok(())
    }
}
