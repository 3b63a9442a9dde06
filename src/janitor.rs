//! Reclaims scratch space held by abandoned, cancelled and finished uploads.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::chunk_store::ChunkStore;
use crate::error::AppError;
use crate::retry::RetryPolicy;
use crate::sessions::{SessionRegistry, UploadSession, UploadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// periodic run; finished sessions linger for the retention period
    Scheduled,
    /// operator request; finished sessions go right away, refused while
    /// anything is assembling
    Manual,
}

#[derive(Debug, Clone, Copy)]
pub struct JanitorPolicy {
    pub stale_after: Duration,
    pub result_retention: Duration,
}

/// why a session is eligible for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    Finished,
    Stale,
}

/// decide whether `session` may be removed now. protected and assembling
/// sessions never are
pub fn eligibility(
    session: &UploadSession,
    now: DateTime<Utc>,
    policy: &JanitorPolicy,
    mode: SweepMode,
) -> Option<RemovalReason> {
    if session.protected {
        return None;
    }
    match session.status {
        UploadStatus::Assembling => None,
        status if status.is_terminal() => match mode {
            SweepMode::Manual => Some(RemovalReason::Finished),
            SweepMode::Scheduled => {
                let finished = session.completed_at.unwrap_or(session.last_activity);
                older_than(finished, now, policy.result_retention).then_some(RemovalReason::Finished)
            }
        },
        _ => older_than(session.last_activity, now, policy.stale_after).then_some(RemovalReason::Stale),
    }
}

fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, age: Duration) -> bool {
    match chrono::Duration::from_std(age) {
        Ok(age) => now - at >= age,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub sessions_removed: usize,
    pub stale_removed: usize,
    pub finished_removed: usize,
    pub orphans_removed: usize,
    /// finished sessions whose fragments were dropped while the record stays
    pub fragments_released: usize,
    pub skipped_protected: usize,
    /// deletions that kept failing after retries; the sweep moved on
    pub failures: Vec<String>,
}

pub struct Janitor {
    sessions: Arc<SessionRegistry>,
    chunks: Arc<ChunkStore>,
    policy: JanitorPolicy,
    retry: RetryPolicy,
}

impl Janitor {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        chunks: Arc<ChunkStore>,
        policy: JanitorPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sessions,
            chunks,
            policy,
            retry,
        }
    }

    pub fn policy(&self) -> &JanitorPolicy {
        &self.policy
    }

    pub async fn sweep(&self, mode: SweepMode) -> Result<SweepReport, AppError> {
        if mode == SweepMode::Manual && self.sessions.any_assembling() {
            return Err(AppError::Busy(
                "an assembly is in progress, try again later".to_string(),
            ));
        }

        let now = Utc::now();
        let mut report = SweepReport::default();

        for session in self.sessions.list() {
            if session.protected {
                report.skipped_protected += 1;
                continue;
            }
            if eligibility(&session, now, &self.policy, mode).is_none() {
                // finished sessions keep their record for status polling,
                // but their fragments are released on the next run
                if session.status.is_terminal() && self.chunks.dir_for(&session.id).exists() {
                    match self.delete_fragments(&session.id).await {
                        Ok(()) => report.fragments_released += 1,
                        Err(e) => report.failures.push(format!("{}: {}", session.id, e)),
                    }
                }
                continue;
            }
            // re-check under the entry lock; protect() may have raced us
            let Some(removed) = self
                .sessions
                .remove_if(&session.id, |s| eligibility(s, now, &self.policy, mode).is_some())
            else {
                continue;
            };
            match eligibility(&removed, now, &self.policy, mode) {
                Some(RemovalReason::Stale) => report.stale_removed += 1,
                _ => report.finished_removed += 1,
            }
            report.sessions_removed += 1;

            if let Err(e) = self.delete_fragments(&removed.id).await {
                report.failures.push(format!("{}: {}", removed.id, e));
            }
        }

        self.sweep_orphans(&mut report).await;

        if report.sessions_removed > 0 || report.orphans_removed > 0 {
            tracing::info!(
                "🧹 Janitor removed {} sessions ({} stale, {} finished) and {} orphaned directories",
                report.sessions_removed,
                report.stale_removed,
                report.finished_removed,
                report.orphans_removed
            );
        }
        if !report.failures.is_empty() {
            tracing::warn!("Janitor could not remove {} entries", report.failures.len());
        }
        Ok(report)
    }

    async fn delete_fragments(&self, id: &str) -> Result<(), std::io::Error> {
        let chunks = self.chunks.clone();
        self.retry
            .start()
            .run(|| {
                let chunks = chunks.clone();
                let id = id.to_string();
                async move { chunks.delete(&id).await }
            })
            .await
            .map_err(|(e, attempts)| {
                tracing::warn!("Giving up on fragments of {} after {} attempts: {}", id, attempts, e);
                e
            })
    }

    // scratch directories no session owns, e.g. left over from a crash
    async fn sweep_orphans(&self, report: &mut SweepReport) {
        let entries = match self.chunks.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                report.failures.push(format!("scan: {}", e));
                return;
            }
        };

        let owned: HashSet<PathBuf> = self
            .sessions
            .list()
            .iter()
            .map(|s| self.chunks.dir_for(&s.id))
            .collect();

        for entry in entries {
            if owned.contains(&entry.dir) {
                continue;
            }
            if let Some(meta) = &entry.metadata {
                if self.sessions.contains(&meta.upload_id) {
                    continue;
                }
            }
            let age = entry
                .modified
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if age < self.policy.stale_after {
                continue;
            }

            let chunks = self.chunks.clone();
            let dir = entry.dir.clone();
            let outcome = self
                .retry
                .start()
                .run(|| {
                    let chunks = chunks.clone();
                    let dir = dir.clone();
                    async move { chunks.remove_dir(&dir).await }
                })
                .await;
            match outcome {
                Ok(()) => report.orphans_removed += 1,
                Err((e, _)) => report.failures.push(format!("{:?}: {}", entry.dir, e)),
            }
        }
    }

    /// run scheduled sweeps forever
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(SweepMode::Scheduled).await {
                    tracing::warn!("Scheduled janitor sweep failed: {}", e);
                }
            }
        })
    }
}
