/// Registry of in-progress chunked transfers.
///
/// Each transfer owns a read/write gate: chunk writes hold it shared (they
/// touch disjoint index-keyed files), a merge holds it exclusively so it never
/// observes a chunk set that changes underneath it.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::errors::AssemblyError;
use crate::models::{TransferSession, TransferStatus};

static TRANSFER_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid transfer id pattern")
});

/// Transfer ids name a directory under the uploads root, so only a safe
/// alphabet is accepted.
pub fn validate_transfer_id(transfer_id: &str) -> Result<(), AssemblyError> {
    if TRANSFER_ID_RE.is_match(transfer_id) {
        Ok(())
    } else {
        Err(AssemblyError::InvalidTransferId(transfer_id.to_string()))
    }
}

/// Original file names end up inside stored names; reject anything that
/// could leave the uploads root.
pub fn validate_filename(filename: &str) -> Result<(), AssemblyError> {
    let bad = filename.trim().is_empty()
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
        || filename.starts_with('.');
    if bad {
        Err(AssemblyError::InvalidFilename(filename.to_string()))
    } else {
        Ok(())
    }
}

/// One active transfer.
pub struct TransferEntry {
    gate: RwLock<()>,
    session: Mutex<TransferSession>,
    retired: AtomicBool,
}

impl TransferEntry {
    fn new(session: TransferSession) -> Self {
        Self {
            gate: RwLock::new(()),
            session: Mutex::new(session),
            retired: AtomicBool::new(false),
        }
    }

    /// Shared access for chunk writes.
    pub async fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Exclusive access for merge.
    pub async fn merge_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// A retired entry has been merged or purged; writers must reopen.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Record a received chunk index.
    pub async fn record(&self, index: u32) {
        let mut session = self.session.lock().await;
        session.received_indices.insert(index);
        session.updated_at = Utc::now();
    }

    pub async fn snapshot(&self) -> TransferSession {
        self.session.lock().await.clone()
    }
}

/// Registry statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub complete: usize,
    pub chunks_received: usize,
}

/// All active transfers, keyed by transfer id.
#[derive(Clone, Default)]
pub struct TransferRegistry {
    entries: Arc<Mutex<HashMap<String, Arc<TransferEntry>>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for a transfer.
    ///
    /// A different `total` than the one the transfer was opened with is
    /// rejected; a file name supplied later fills in a missing one.
    pub async fn open(
        &self,
        transfer_id: &str,
        total: u32,
        filename: Option<&str>,
    ) -> Result<Arc<TransferEntry>, AssemblyError> {
        self.open_seeded(transfer_id, total, filename, BTreeSet::new()).await
    }

    /// Like [`open`](Self::open), but a newly created session starts with
    /// `received` already recorded, e.g. chunks found on disk after a restart.
    /// Indices outside `0..total` are ignored; an existing session is left as is.
    pub async fn open_seeded(
        &self,
        transfer_id: &str,
        total: u32,
        filename: Option<&str>,
        received: BTreeSet<u32>,
    ) -> Result<Arc<TransferEntry>, AssemblyError> {
        validate_transfer_id(transfer_id)?;

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(transfer_id) {
            let mut session = entry.session.lock().await;
            if session.total_chunks != total {
                return Err(AssemblyError::TotalMismatch {
                    expected: session.total_chunks,
                    got: total,
                });
            }
            if session.original_filename.is_none() {
                session.original_filename = filename.map(str::to_string);
            }
            return Ok(entry.clone());
        }

        let mut session = TransferSession::new(transfer_id, total, filename.map(str::to_string));
        session.received_indices = received.into_iter().filter(|index| *index < total).collect();
        let resumed = session.received_indices.len();
        let entry = Arc::new(TransferEntry::new(session));
        entries.insert(transfer_id.to_string(), entry.clone());
        if resumed > 0 {
            info!("Transfer {} resumed ({} of {} chunks present)", transfer_id, resumed, total);
        } else {
            info!("Transfer {} opened ({} chunks)", transfer_id, total);
        }
        Ok(entry)
    }

    /// Look up an existing entry.
    pub async fn get(&self, transfer_id: &str) -> Option<Arc<TransferEntry>> {
        self.entries.lock().await.get(transfer_id).cloned()
    }

    /// Status snapshot of a transfer, if it is tracked.
    pub async fn status(&self, transfer_id: &str) -> Option<TransferStatus> {
        let entry = self.get(transfer_id).await?;
        let session = entry.session.lock().await;
        Some(session.status())
    }

    /// Remove an entry and mark it retired so late writers reopen a fresh one.
    ///
    /// Callers retiring after a merge hold the entry's merge gate.
    pub async fn retire(&self, transfer_id: &str) {
        if let Some(entry) = self.entries.lock().await.remove(transfer_id) {
            entry.retire();
            debug!("Transfer {} retired", transfer_id);
        }
    }

    /// Ids of transfers not updated for longer than `max_age`.
    pub async fn stale(&self, max_age: Duration) -> Vec<String> {
        let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX / 1_000);
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs);
        let entries = self.entries.lock().await;
        let mut stale = Vec::new();
        for (id, entry) in entries.iter() {
            if entry.session.lock().await.updated_at <= cutoff {
                stale.push(id.clone());
            }
        }
        stale
    }

    pub async fn stats(&self) -> RegistryStats {
        let entries = self.entries.lock().await;
        let mut complete = 0;
        let mut chunks_received = 0;
        for entry in entries.values() {
            let session = entry.session.lock().await;
            chunks_received += session.received_indices.len();
            if session.is_complete() {
                complete += 1;
            }
        }
        RegistryStats {
            active: entries.len(),
            complete,
            chunks_received,
        }
    }
}
