//! In-memory chunked file uploads and the per-password recent-files
//! list.
//!
//! A transfer buffers base64 chunks keyed by index until the uploader
//! signals completion, at which point the chunks are concatenated in
//! ascending index order and handed back as a single base64 payload for
//! forwarding to the host. Completed transfers stick around for a grace
//! window (the relay schedules the purge) so late progress queries don't
//! 404 the uploader.

use base64::Engine;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::protocol::{now_ms, RecentFile};
use crate::registry::ConnectionId;

/// MIME types accepted for upload, besides anything under `text/`.
pub const ALLOWED_FILE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "application/pdf",
    "application/zip",
    "application/json",
    "application/octet-stream",
];

pub fn file_type_allowed(mime: &str) -> bool {
    mime.starts_with("text/") || ALLOWED_FILE_TYPES.contains(&mime)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

/// The display strings are the inline `error` messages on the wire.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("File too large")]
    TooLarge,
    #[error("File type not allowed")]
    TypeNotAllowed,
    #[error("Unknown transfer")]
    UnknownTransfer,
    #[error("Invalid chunk encoding")]
    BadChunk(#[from] base64::DecodeError),
}

/// Progress snapshot after a chunk lands.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkProgress {
    pub transfer_id: String,
    /// 0..=100.
    pub progress: u32,
    /// Bytes per second; 0 when no time has elapsed.
    pub speed: f64,
    /// Seconds remaining at the current speed; 0 when undefined.
    pub eta: f64,
}

/// Everything the relay needs to forward a finished upload to the host.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub password: String,
    /// Reassembled payload, base64-encoded.
    pub data_base64: String,
}

struct FileTransfer {
    file_name: String,
    file_size: u64,
    file_type: String,
    password: String,
    direction: TransferDirection,
    owner: ConnectionId,
    chunks: BTreeMap<u32, Vec<u8>>,
    received: u64,
    status: TransferStatus,
    started: Instant,
}

struct TransferInner {
    transfers: HashMap<String, FileTransfer>,
    recent: HashMap<String, VecDeque<RecentFile>>,
}

/// Guarded transfer buffers and recent-file lists.
pub struct TransferStore {
    inner: Mutex<TransferInner>,
    max_file_size: u64,
    recent_limit: usize,
}

impl TransferStore {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Mutex::new(TransferInner {
                transfers: HashMap::new(),
                recent: HashMap::new(),
            }),
            max_file_size: config.max_file_size,
            recent_limit: config.recent_files_limit,
        }
    }

    /// Validate and allocate an upload, returning the transfer id.
    pub fn begin_upload(
        &self,
        owner: ConnectionId,
        password: &str,
        file_name: &str,
        file_size: u64,
        file_type: &str,
    ) -> Result<String, TransferError> {
        if file_size > self.max_file_size {
            return Err(TransferError::TooLarge);
        }
        if !file_type_allowed(file_type) {
            return Err(TransferError::TypeNotAllowed);
        }
        let id = Uuid::new_v4().to_string();
        self.inner.lock().transfers.insert(
            id.clone(),
            FileTransfer {
                file_name: file_name.to_string(),
                file_size,
                file_type: file_type.to_string(),
                password: password.to_string(),
                direction: TransferDirection::Upload,
                owner,
                chunks: BTreeMap::new(),
                received: 0,
                status: TransferStatus::Pending,
                started: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Decode and store one chunk. Out-of-order indices are fine;
    /// duplicates overwrite.
    pub fn store_chunk(
        &self,
        transfer_id: &str,
        chunk_index: u32,
        data: &str,
    ) -> Result<ChunkProgress, TransferError> {
        let decoded = base64::engine::general_purpose::STANDARD.decode(data)?;
        let mut inner = self.inner.lock();
        let transfer = inner
            .transfers
            .get_mut(transfer_id)
            .ok_or(TransferError::UnknownTransfer)?;

        if let Some(old) = transfer.chunks.insert(chunk_index, decoded) {
            transfer.received -= old.len() as u64;
        }
        transfer.received += transfer.chunks[&chunk_index].len() as u64;
        transfer.status = TransferStatus::Transferring;

        let elapsed = transfer.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            transfer.received as f64 / elapsed
        } else {
            0.0
        };
        let eta = if speed > 0.0 && transfer.file_size > transfer.received {
            (transfer.file_size - transfer.received) as f64 / speed
        } else {
            0.0
        };
        let progress = if transfer.file_size == 0 {
            0
        } else {
            ((transfer.received * 100) / transfer.file_size).min(100) as u32
        };
        Ok(ChunkProgress {
            transfer_id: transfer_id.to_string(),
            progress,
            speed,
            eta,
        })
    }

    /// Reassemble the upload, record it in the password's recent files,
    /// and mark it completed. The record is retained until `purge`.
    pub fn complete(&self, transfer_id: &str) -> Result<CompletedUpload, TransferError> {
        let mut inner = self.inner.lock();
        let transfer = inner
            .transfers
            .get_mut(transfer_id)
            .ok_or(TransferError::UnknownTransfer)?;

        let mut assembled = Vec::with_capacity(transfer.received as usize);
        for chunk in transfer.chunks.values() {
            assembled.extend_from_slice(chunk);
        }
        transfer.status = TransferStatus::Completed;

        let completed = CompletedUpload {
            transfer_id: transfer_id.to_string(),
            file_name: transfer.file_name.clone(),
            file_size: transfer.file_size,
            file_type: transfer.file_type.clone(),
            password: transfer.password.clone(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(&assembled),
        };

        let entry = RecentFile {
            file_name: completed.file_name.clone(),
            file_size: completed.file_size,
            file_type: completed.file_type.clone(),
            direction: transfer.direction.as_str().to_string(),
            timestamp: now_ms(),
        };
        let password = transfer.password.clone();
        let recent = inner.recent.entry(password).or_default();
        recent.push_front(entry);
        recent.truncate(self.recent_limit);

        Ok(completed)
    }

    /// Drop a transfer on explicit cancellation.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.transfers.get_mut(transfer_id) {
            Some(t) => {
                t.status = TransferStatus::Cancelled;
            }
            None => return false,
        }
        inner.transfers.remove(transfer_id);
        true
    }

    /// Drop every in-flight transfer owned by a disconnecting transport.
    /// Completed transfers are left for their scheduled purge.
    pub fn cancel_for_conn(&self, conn: ConnectionId) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .transfers
            .iter()
            .filter(|(_, t)| t.owner == conn && t.status != TransferStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            inner.transfers.remove(id);
        }
        doomed.len()
    }

    /// Remove a completed transfer after its grace window.
    pub fn purge(&self, transfer_id: &str) {
        let mut inner = self.inner.lock();
        if inner
            .transfers
            .get(transfer_id)
            .map(|t| t.status == TransferStatus::Completed)
            .unwrap_or(false)
        {
            inner.transfers.remove(transfer_id);
        }
    }

    /// Recent files for a password, newest first.
    pub fn recent_files(&self, password: &str) -> Vec<RecentFile> {
        self.inner
            .lock()
            .recent
            .get(password)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn contains(&self, transfer_id: &str) -> bool {
        self.inner.lock().transfers.contains_key(transfer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    fn store() -> TransferStore {
        TransferStore::new(&RelayConfig {
            max_file_size: 1024,
            recent_files_limit: 3,
            ..RelayConfig::default()
        })
    }

    #[test]
    fn out_of_order_chunks_reassemble_in_index_order() {
        let transfers = store();
        let id = transfers
            .begin_upload(1, "alpha", "a.txt", 10, "text/plain")
            .unwrap();

        transfers.store_chunk(&id, 1, &b64(b"56789")).unwrap();
        transfers.store_chunk(&id, 0, &b64(b"01234")).unwrap();

        let completed = transfers.complete(&id).unwrap();
        assert_eq!(completed.data_base64, b64(b"0123456789"));
        assert_eq!(completed.file_name, "a.txt");
        assert_eq!(completed.file_size, 10);
    }

    #[test]
    fn duplicate_chunk_overwrites() {
        let transfers = store();
        let id = transfers
            .begin_upload(1, "alpha", "a.txt", 5, "text/plain")
            .unwrap();

        transfers.store_chunk(&id, 0, &b64(b"XXXXX")).unwrap();
        let progress = transfers.store_chunk(&id, 0, &b64(b"hello")).unwrap();
        assert_eq!(progress.progress, 100);

        let completed = transfers.complete(&id).unwrap();
        assert_eq!(completed.data_base64, b64(b"hello"));
    }

    #[test]
    fn sparse_chunks_concatenate_what_is_present() {
        let transfers = store();
        let id = transfers
            .begin_upload(1, "alpha", "gap.bin", 20, "application/octet-stream")
            .unwrap();
        transfers.store_chunk(&id, 0, &b64(b"aa")).unwrap();
        transfers.store_chunk(&id, 5, &b64(b"bb")).unwrap();

        let completed = transfers.complete(&id).unwrap();
        assert_eq!(completed.data_base64, b64(b"aabb"));
    }

    #[test]
    fn oversize_upload_rejected() {
        let transfers = store();
        let err = transfers
            .begin_upload(1, "alpha", "big.bin", 4096, "application/zip")
            .unwrap_err();
        assert_eq!(err.to_string(), "File too large");
    }

    #[test]
    fn mime_allowlist() {
        assert!(file_type_allowed("text/plain"));
        assert!(file_type_allowed("text/x-rust"));
        assert!(file_type_allowed("image/png"));
        assert!(file_type_allowed("application/pdf"));
        assert!(!file_type_allowed("application/x-msdownload"));
        assert!(!file_type_allowed(""));

        let transfers = store();
        let err = transfers
            .begin_upload(1, "alpha", "evil.exe", 10, "application/x-msdownload")
            .unwrap_err();
        assert_eq!(err.to_string(), "File type not allowed");
    }

    #[test]
    fn chunk_for_unknown_transfer() {
        let transfers = store();
        let err = transfers.store_chunk("nope", 0, &b64(b"x")).unwrap_err();
        assert!(matches!(err, TransferError::UnknownTransfer));
    }

    #[test]
    fn invalid_base64_rejected() {
        let transfers = store();
        let id = transfers
            .begin_upload(1, "alpha", "a.txt", 10, "text/plain")
            .unwrap();
        let err = transfers.store_chunk(&id, 0, "!!not-base64!!").unwrap_err();
        assert!(matches!(err, TransferError::BadChunk(_)));
    }

    #[test]
    fn progress_reflects_received_bytes() {
        let transfers = store();
        let id = transfers
            .begin_upload(1, "alpha", "a.txt", 100, "text/plain")
            .unwrap();
        let progress = transfers.store_chunk(&id, 0, &b64(&[0u8; 25])).unwrap();
        assert_eq!(progress.progress, 25);
        let progress = transfers.store_chunk(&id, 1, &b64(&[0u8; 75])).unwrap();
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.eta, 0.0);
    }

    #[test]
    fn cancel_removes_transfer() {
        let transfers = store();
        let id = transfers
            .begin_upload(1, "alpha", "a.txt", 10, "text/plain")
            .unwrap();
        assert!(transfers.cancel(&id));
        assert!(!transfers.cancel(&id));
        assert!(matches!(
            transfers.complete(&id),
            Err(TransferError::UnknownTransfer)
        ));
    }

    #[test]
    fn uploader_disconnect_cancels_in_flight_only() {
        let transfers = store();
        let in_flight = transfers
            .begin_upload(1, "alpha", "a.txt", 10, "text/plain")
            .unwrap();
        let done = transfers
            .begin_upload(1, "alpha", "b.txt", 2, "text/plain")
            .unwrap();
        transfers.store_chunk(&done, 0, &b64(b"ok")).unwrap();
        transfers.complete(&done).unwrap();
        let other = transfers
            .begin_upload(2, "alpha", "c.txt", 10, "text/plain")
            .unwrap();

        assert_eq!(transfers.cancel_for_conn(1), 1);
        assert!(!transfers.contains(&in_flight));
        assert!(transfers.contains(&done));
        assert!(transfers.contains(&other));
    }

    #[test]
    fn purge_only_touches_completed() {
        let transfers = store();
        let pending = transfers
            .begin_upload(1, "alpha", "a.txt", 10, "text/plain")
            .unwrap();
        transfers.purge(&pending);
        assert!(transfers.contains(&pending));

        transfers.store_chunk(&pending, 0, &b64(b"0123456789")).unwrap();
        transfers.complete(&pending).unwrap();
        transfers.purge(&pending);
        assert!(!transfers.contains(&pending));
    }

    #[test]
    fn recent_files_fifo_is_capped_and_newest_first() {
        let transfers = store();
        for name in ["a", "b", "c", "d"] {
            let id = transfers
                .begin_upload(1, "alpha", &format!("{name}.txt"), 1, "text/plain")
                .unwrap();
            transfers.store_chunk(&id, 0, &b64(b"x")).unwrap();
            transfers.complete(&id).unwrap();
        }

        let recent = transfers.recent_files("alpha");
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].file_name, "d.txt");
        assert_eq!(recent[2].file_name, "b.txt");
        assert!(transfers.recent_files("beta").is_empty());
    }
}
