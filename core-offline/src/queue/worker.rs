//! Task execution: streamed fetch, capacity check, persist.

use bridge_traits::http::HttpRequest;
use bytes::{Bytes, BytesMut};
use core_runtime::events::DownloadEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::task::{DownloadTask, TaskTarget};
use super::{AbortKind, Shared};
use crate::error::{OfflineError, Result};
use crate::model::{AudioBlob, CacheKind, TrackMeta, Variant};
use crate::progress::DownloadProgress;

/// Upper bound for the up-front buffer reservation.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Run one task to completion or abort and report the outcome to the queue.
pub(super) async fn execute(
    shared: Arc<Shared>,
    task: DownloadTask,
    token: CancellationToken,
    abort: Arc<Mutex<Option<AbortKind>>>,
) {
    shared.emit(DownloadEvent::Started {
        task_id: task.id.to_string(),
        uid: task.uid.clone(),
        variant: task.variant_label(),
        priority: task.priority.as_u8(),
        attempt: task.retries + 1,
    });

    let started = std::time::Instant::now();
    let result = tokio::select! {
        _ = token.cancelled() => Err(OfflineError::Cancelled),
        result = shared.fetch_and_store(&task) => result,
    };

    let abort_kind = abort.lock().take();
    shared.finish(task, result, abort_kind, started.elapsed());
}

impl Shared {
    #[instrument(skip(self, task), fields(uid = %task.uid, priority = %task.priority))]
    async fn fetch_and_store(&self, task: &DownloadTask) -> Result<u64> {
        let bytes = self.fetch(task).await?;
        let size = bytes.len() as u64;

        match &task.target {
            TaskTarget::Audio { variant, .. } => self.persist_audio(task, *variant, bytes).await?,
            TaskTarget::Asset { key, .. } => self.persist_asset(key, bytes).await?,
        }

        debug!(size, "Task persisted");
        Ok(size)
    }

    /// Stream the body, bounding every read by the stall timeout.
    async fn fetch(&self, task: &DownloadTask) -> Result<Bytes> {
        let stall_timeout = self.config.stall_timeout;
        let stream = self
            .http
            .download_stream(HttpRequest::get(task.target.url()))
            .await?;

        let total = stream.content_length;
        let mut reader = stream.reader;
        let mut buffer = BytesMut::with_capacity(total.unwrap_or(0).min(MAX_PREALLOCATION) as usize);
        let mut chunk = vec![0u8; self.config.read_chunk_size];

        let mut progress = DownloadProgress::new(task.uid.clone(), total);
        let mut last_percent = 0u8;
        let mut last_reported = 0u64;

        loop {
            let read = match tokio::time::timeout(stall_timeout, reader.read(&mut chunk)).await {
                Err(_) => {
                    return Err(OfflineError::TransientNetwork(format!(
                        "No data for {} ms",
                        stall_timeout.as_millis()
                    )))
                }
                Ok(Err(e)) => return Err(OfflineError::TransientNetwork(e.to_string())),
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
            };

            buffer.extend_from_slice(&chunk[..read]);
            progress.update(buffer.len() as u64);

            let due = match total {
                Some(_) => progress.progress_percent != last_percent,
                None => progress.downloaded_bytes - last_reported >= self.config.progress_interval_bytes,
            };
            if due {
                last_percent = progress.progress_percent;
                last_reported = progress.downloaded_bytes;
                self.emit(DownloadEvent::Progress {
                    task_id: task.id.to_string(),
                    uid: task.uid.clone(),
                    bytes_downloaded: progress.downloaded_bytes,
                    total_bytes: total,
                    percent: progress.progress_percent,
                });
            }
        }

        if let Some(expected) = total {
            if buffer.len() as u64 != expected {
                return Err(OfflineError::TransientNetwork(format!(
                    "Body truncated: {} of {} bytes",
                    buffer.len(),
                    expected
                )));
            }
        }

        debug!(
            uid = %task.uid,
            bytes = buffer.len(),
            speed = %progress.speed_string(),
            "Download finished"
        );
        Ok(buffer.freeze())
    }

    async fn persist_audio(&self, task: &DownloadTask, variant: Variant, bytes: Bytes) -> Result<()> {
        let size = bytes.len() as u64;
        if let Some(guard) = &self.capacity {
            guard.make_room(size, &task.uid).await?;
        }

        let blob = AudioBlob::new(task.uid.clone(), variant, bytes, self.clock.unix_timestamp());
        let meta = completed_meta(task, variant, size);

        match self.store.put_blob_with_meta(&blob, &meta).await {
            Err(OfflineError::QuotaExceeded(reason)) => {
                let Some(guard) = &self.capacity else {
                    return Err(OfflineError::QuotaExceeded(reason));
                };
                debug!(uid = %task.uid, reason = %reason, "Store full, reclaiming once");
                guard.make_room(size, &task.uid).await?;
                self.store.put_blob_with_meta(&blob, &meta).await?;
            }
            other => other?,
        }

        // A fresh copy starts as the most recently used.
        self.store.touch(&task.uid).await
    }

    async fn persist_asset(&self, key: &str, bytes: Bytes) -> Result<()> {
        let size = bytes.len() as u64;
        match self.store.put_asset(key, bytes.clone()).await {
            Err(OfflineError::QuotaExceeded(reason)) => {
                let Some(guard) = &self.capacity else {
                    return Err(OfflineError::QuotaExceeded(reason));
                };
                guard.make_room(size, key).await?;
                self.store.put_asset(key, bytes).await
            }
            other => other,
        }
    }
}

/// Metadata after a successful download. The store keeps pinned, cloud and
/// selection flags of an existing row and merges the kind against them; a
/// new row is never pinned.
fn completed_meta(task: &DownloadTask, variant: Variant, size: u64) -> TrackMeta {
    let mut meta = TrackMeta::new(task.uid.clone());
    meta.cache_kind = merged_kind(&meta, task.cache_kind);
    meta.cached_variant = Some(variant);
    meta.cached_complete = 100;
    meta.stored_size_bytes = Some(size);
    meta
}

/// Keep the stronger of the existing and requested kinds. Only a pinned
/// track may carry the pinned kind.
fn merged_kind(meta: &TrackMeta, requested: CacheKind) -> CacheKind {
    if meta.pinned {
        return CacheKind::Pinned;
    }

    let kind = if meta.cache_kind.retention_rank() >= requested.retention_rank() {
        meta.cache_kind
    } else {
        requested
    };

    match kind {
        CacheKind::Pinned => CacheKind::Cloud,
        other => other,
    }
}
