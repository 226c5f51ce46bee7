//! In-memory gallery of enrolled faces: parallel label/embedding arrays for
//! matching plus a user map for metadata. The authoritative roster lives in
//! the store; the reconciler keeps this copy in agreement.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::common::error::Result;
use crate::core::engine::RecognitionEngine;
use crate::core::recognizer::{cosine_similarity, Embedding};
use crate::store::Repository;

#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub enroll_id: i64,
    pub name: String,
    pub has_face: bool,
    pub is_active: bool,
}

#[derive(Default)]
struct GalleryInner {
    // labels[i] and embeddings[i] always describe the same user
    labels: Vec<i64>,
    embeddings: Vec<Embedding>,
    users: HashMap<i64, UserInfo>,
}

impl GalleryInner {
    fn upsert(&mut self, enroll_id: i64, embedding: Embedding, name: String, is_active: bool) {
        if let Some(pos) = self.labels.iter().position(|&id| id == enroll_id) {
            self.labels.remove(pos);
            self.embeddings.remove(pos);
        }
        self.labels.push(enroll_id);
        self.embeddings.push(embedding);
        self.users.insert(
            enroll_id,
            UserInfo {
                enroll_id,
                name,
                has_face: true,
                is_active,
            },
        );
    }
}

#[derive(Default)]
pub struct Gallery {
    inner: RwLock<GalleryInner>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the store. The replacement triple is assembled off to
    /// the side and swapped in under a single write lock, so concurrent
    /// matches never observe a half-populated gallery.
    pub async fn load_all(&self, repo: &dyn Repository, engine: &RecognitionEngine) -> Result<usize> {
        let snapshot = repo.snapshot_active_face_users().await?;

        let mut fresh = GalleryInner::default();
        for (&enroll_id, &is_active) in &snapshot {
            let Some(row) = repo.fetch_face_row(enroll_id).await? else {
                continue;
            };
            match engine.embed_bytes(&row.record, false).await {
                Some(embedding) => fresh.upsert(enroll_id, embedding, row.name, is_active),
                None => {
                    tracing::warn!(enroll_id, "stored face record did not produce an embedding");
                }
            }
        }

        let loaded = fresh.labels.len();
        *self.inner.write().await = fresh;
        tracing::info!(loaded, "gallery loaded");
        Ok(loaded)
    }

    pub async fn upsert(&self, enroll_id: i64, embedding: Embedding, name: &str, is_active: bool) {
        let mut inner = self.inner.write().await;
        inner.upsert(enroll_id, embedding, name.to_string(), is_active);
    }

    pub async fn remove(&self, enroll_id: i64) -> bool {
        let mut inner = self.inner.write().await;
        let existed = inner.users.remove(&enroll_id).is_some();
        if let Some(pos) = inner.labels.iter().position(|&id| id == enroll_id) {
            inner.labels.remove(pos);
            inner.embeddings.remove(pos);
        }
        existed
    }

    /// Flip a user's active flag in place. Returns false for unknown ids.
    pub async fn set_active(&self, enroll_id: i64, is_active: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.users.get_mut(&enroll_id) {
            Some(user) => {
                user.is_active = is_active;
                true
            }
            None => false,
        }
    }

    pub async fn user(&self, enroll_id: i64) -> Option<UserInfo> {
        self.inner.read().await.users.get(&enroll_id).cloned()
    }

    pub async fn users(&self) -> HashMap<i64, UserInfo> {
        self.inner.read().await.users.clone()
    }

    pub async fn ids(&self) -> HashSet<i64> {
        self.inner.read().await.labels.iter().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.labels.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Nearest neighbor by cosine similarity over every enrolled embedding,
    /// evaluated under the shared read lock.
    pub async fn best_match(&self, probe: &[f32]) -> Option<(i64, f32)> {
        let inner = self.inner.read().await;

        let mut best: Option<(i64, f32)> = None;
        for (label, embedding) in inner.labels.iter().zip(inner.embeddings.iter()) {
            let score = cosine_similarity(probe, embedding);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((*label, score));
            }
        }
        best
    }
}
