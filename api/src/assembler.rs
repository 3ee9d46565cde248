/// Chunked upload ingestion and ordered reassembly.
///
/// Layout under the uploads root:
/// - `{transfer_id}/chunk-{index}`: one file per received chunk
/// - `{uuid}-{filename}`: merged artifacts and direct uploads, stored flat
///
/// Files are always written under a hidden temporary name and renamed into
/// place, so a reader never sees a partially written chunk or artifact.
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fetchgate_shared::errors::AssemblyError;
use fetchgate_shared::models::{MergedArtifact, StoredUpload, TransferSession, TransferStatus};
use fetchgate_shared::transfer_registry::{validate_filename, validate_transfer_id, TransferEntry, TransferRegistry};

const CHUNK_PREFIX: &str = "chunk-";

fn chunk_file(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{CHUNK_PREFIX}{index}"))
}

fn temp_name(prefix: &str) -> String {
    format!(".{}-{}", prefix, Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct ChunkAssembler {
    root: PathBuf,
    registry: TransferRegistry,
}

impl ChunkAssembler {
    pub fn new(root: impl Into<PathBuf>, registry: TransferRegistry) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    fn chunk_dir(&self, transfer_id: &str) -> PathBuf {
        self.root.join(transfer_id)
    }

    /// Registry entry for a transfer. A session created here picks up the
    /// chunks already on disk, so a restart does not lose track of them.
    async fn open_entry(
        &self,
        transfer_id: &str,
        total: u32,
        filename: Option<&str>,
    ) -> Result<Arc<TransferEntry>, AssemblyError> {
        if self.registry.get(transfer_id).await.is_some() {
            return self.registry.open(transfer_id, total, filename).await;
        }
        let on_disk = match self.scan_chunks(transfer_id).await {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        self.registry.open_seeded(transfer_id, total, filename, on_disk).await
    }

    /// Store one chunk. Re-uploading an index replaces the earlier payload.
    pub async fn put_chunk(
        &self,
        transfer_id: &str,
        index: u32,
        total: u32,
        filename: Option<&str>,
        payload: Bytes,
    ) -> Result<TransferStatus, AssemblyError> {
        validate_transfer_id(transfer_id)?;
        if index >= total {
            return Err(AssemblyError::InvalidIndex { index, total });
        }
        if let Some(name) = filename {
            validate_filename(name)?;
        }

        loop {
            let entry = self.open_entry(transfer_id, total, filename).await?;
            let _gate = entry.write_gate().await;
            // A merge or purge finished while we waited; start a fresh session.
            if entry.is_retired() {
                continue;
            }

            let dir = self.chunk_dir(transfer_id);
            fs::create_dir_all(&dir).await?;
            let tmp = dir.join(temp_name(CHUNK_PREFIX));
            if let Err(e) = write_then_rename(&tmp, &chunk_file(&dir, index), &payload).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e.into());
            }

            entry.record(index).await;
            debug!(
                "Stored chunk {} of transfer {} ({} bytes)",
                index,
                transfer_id,
                payload.len()
            );
            return Ok(entry.snapshot().await.status());
        }
    }

    /// Concatenate chunks `0..total` into a new artifact named
    /// `{uuid}-{filename}`.
    ///
    /// Every index is checked before any output is written; the first gap
    /// fails with [`AssemblyError::MissingChunk`] and leaves the chunks in place.
    pub async fn merge(&self, transfer_id: &str, filename: &str, total: u32) -> Result<MergedArtifact, AssemblyError> {
        validate_transfer_id(transfer_id)?;
        validate_filename(filename)?;
        if total == 0 {
            return Err(AssemblyError::InvalidIndex { index: 0, total });
        }

        loop {
            let entry = self.open_entry(transfer_id, total, Some(filename)).await?;
            let _gate = entry.merge_gate().await;
            if entry.is_retired() {
                continue;
            }

            let dir = self.chunk_dir(transfer_id);
            for index in 0..total {
                let present = fs::metadata(chunk_file(&dir, index))
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false);
                if !present {
                    warn!("Merge of transfer {} blocked: missing chunk {}", transfer_id, index);
                    return Err(AssemblyError::MissingChunk(index));
                }
            }

            let partial = self.root.join(temp_name("partial"));
            let size = match concat_chunks(&dir, total, &partial).await {
                Ok(size) => size,
                Err(e) => {
                    let _ = fs::remove_file(&partial).await;
                    return Err(e.into());
                }
            };

            let stored_name = format!("{}-{}", Uuid::new_v4(), filename);
            persist(&partial, &self.root.join(&stored_name)).await?;

            if let Err(e) = fs::remove_dir_all(&dir).await {
                warn!("Failed to remove chunks of transfer {}: {}", transfer_id, e);
            }
            self.registry.retire(transfer_id).await;
            info!(
                "Merged transfer {} into {} ({} chunks, {} bytes)",
                transfer_id, stored_name, total, size
            );
            return Ok(MergedArtifact { stored_name, size });
        }
    }

    /// Received and missing indices of a transfer.
    ///
    /// Falls back to the chunk directory when the registry has no session,
    /// e.g. after a restart. `total` is then taken from the caller, or inferred
    /// from the highest index on disk.
    pub async fn status(&self, transfer_id: &str, total: Option<u32>) -> Result<TransferStatus, AssemblyError> {
        validate_transfer_id(transfer_id)?;
        if let Some(status) = self.registry.status(transfer_id).await {
            return Ok(status);
        }

        let received = match self.scan_chunks(transfer_id).await {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AssemblyError::UnknownTransfer(transfer_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let inferred = received.last().map_or(0, |max| max + 1);
        let mut session = TransferSession::new(transfer_id, total.unwrap_or(inferred).max(inferred), None);
        session.received_indices = received;
        Ok(session.status())
    }

    async fn scan_chunks(&self, transfer_id: &str) -> std::io::Result<BTreeSet<u32>> {
        let mut entries = fs::read_dir(self.chunk_dir(transfer_id)).await?;
        let mut received = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let index = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(CHUNK_PREFIX))
                .and_then(|index| index.parse::<u32>().ok());
            if let Some(index) = index {
                received.insert(index);
            }
        }
        Ok(received)
    }

    /// Store a directly uploaded file as `{uuid}-{filename}`.
    pub async fn store_upload<S, E>(&self, filename: &str, body: S) -> Result<StoredUpload, AssemblyError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        validate_filename(filename)?;
        let partial = self.root.join(temp_name("upload"));
        let size = match write_stream(&partial, body).await {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };

        let stored_name = format!("{}-{}", Uuid::new_v4(), filename);
        persist(&partial, &self.root.join(&stored_name)).await?;
        info!("Stored upload {} as {} ({} bytes)", filename, stored_name, size);

        Ok(StoredUpload {
            original_name: filename.to_string(),
            stored_name,
            size,
        })
    }

    /// Drop transfers idle for longer than `ttl`, with their chunk files.
    ///
    /// Chunk directories with no session (left over from a previous run) are
    /// removed once their modification time is older than `ttl`.
    pub async fn purge_stale(&self, ttl: Duration) -> Result<usize, AssemblyError> {
        let mut purged = 0;
        for transfer_id in self.registry.stale(ttl).await {
            let Some(entry) = self.registry.get(&transfer_id).await else {
                continue;
            };
            let _gate = entry.merge_gate().await;
            if entry.is_retired() {
                continue;
            }
            remove_dir_if_present(&self.chunk_dir(&transfer_id)).await?;
            self.registry.retire(&transfer_id).await;
            info!("Purged stale transfer {}", transfer_id);
            purged += 1;
        }

        let cutoff = SystemTime::now().checked_sub(ttl).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_transfer_id(&name).is_err() || self.registry.get(&name).await.is_some() {
                continue;
            }
            let meta = entry.metadata().await?;
            let old = meta.modified().map(|m| m <= cutoff).unwrap_or(false);
            if meta.is_dir() && old {
                remove_dir_if_present(&entry.path()).await?;
                info!("Purged orphaned chunk directory {}", name);
                purged += 1;
            }
        }
        Ok(purged)
    }
}

async fn write_then_rename(tmp: &Path, dest: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(payload).await?;
    file.flush().await?;
    drop(file);
    fs::rename(tmp, dest).await
}

/// Move a finished temp file into place, removing it if the move fails.
async fn persist(partial: &Path, dest: &Path) -> std::io::Result<()> {
    if let Err(e) = fs::rename(partial, dest).await {
        let _ = fs::remove_file(partial).await;
        return Err(e);
    }
    Ok(())
}

async fn concat_chunks(dir: &Path, total: u32, dest: &Path) -> std::io::Result<u64> {
    let mut out = fs::File::create(dest).await?;
    let mut size = 0;
    for index in 0..total {
        let mut chunk = fs::File::open(chunk_file(dir, index)).await?;
        size += tokio::io::copy(&mut chunk, &mut out).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(size)
}

async fn write_stream<S, E>(dest: &Path, body: S) -> std::io::Result<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut body = std::pin::pin!(body);
    let mut out = fs::File::create(dest).await?;
    let mut size = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        out.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    out.flush().await?;
    Ok(size)
}

async fn remove_dir_if_present(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ChunkAssembler) {
        let dir = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new(dir.path(), TransferRegistry::new());
        (dir, assembler)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    /// Names of visible (non-hidden) regular files in the root.
    async fn artifacts(root: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(root).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.metadata().await.unwrap().is_file() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names
    }

    #[tokio::test]
    async fn test_permuted_upload_merges_identically() {
        let (dir, assembler) = setup();
        let data = sample(10_000);
        let chunks: Vec<&[u8]> = data.chunks(1_024).collect();
        let total = chunks.len() as u32;

        let mut order: Vec<u32> = (0..total).collect();
        order.shuffle(&mut rand::thread_rng());
        for index in order {
            let payload = Bytes::copy_from_slice(chunks[index as usize]);
            assembler.put_chunk("123abc456", index, total, None, payload).await.unwrap();
        }

        let merged = assembler.merge("123abc456", "bigfile.zip", total).await.unwrap();
        assert!(merged.stored_name.ends_with("-bigfile.zip"));
        assert_eq!(merged.size, 10_000);

        let bytes = fs::read(dir.path().join(&merged.stored_name)).await.unwrap();
        assert_eq!(bytes, data);
        assert!(!dir.path().join("123abc456").exists());
        assert_eq!(assembler.registry().stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_missing_chunk_produces_no_artifact() {
        let (dir, assembler) = setup();
        for index in [0, 1, 3] {
            assembler
                .put_chunk("t1", index, 4, Some("big.zip"), Bytes::from_static(b"data"))
                .await
                .unwrap();
        }

        let err = assembler.merge("t1", "big.zip", 4).await.unwrap_err();
        assert!(matches!(err, AssemblyError::MissingChunk(2)));
        assert!(artifacts(dir.path()).await.is_empty());

        // Chunks survive so the client can upload the gap and retry.
        assembler.put_chunk("t1", 2, 4, None, Bytes::from_static(b"data")).await.unwrap();
        let merged = assembler.merge("t1", "big.zip", 4).await.unwrap();
        assert_eq!(merged.size, 16);
        assert_eq!(artifacts(dir.path()).await, vec![merged.stored_name]);
    }

    #[tokio::test]
    async fn test_reupload_overwrites() {
        let (dir, assembler) = setup();
        assembler.put_chunk("t1", 0, 2, None, Bytes::from_static(b"old-old")).await.unwrap();
        assembler.put_chunk("t1", 0, 2, None, Bytes::from_static(b"new")).await.unwrap();
        let status = assembler.put_chunk("t1", 1, 2, None, Bytes::from_static(b"!")).await.unwrap();
        assert!(status.complete);

        let merged = assembler.merge("t1", "a.txt", 2).await.unwrap();
        let bytes = fs::read(dir.path().join(&merged.stored_name)).await.unwrap();
        assert_eq!(bytes, b"new!");
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let (_dir, assembler) = setup();
        let payload = Bytes::from_static(b"x");
        assert!(matches!(
            assembler.put_chunk("t1", 3, 3, None, payload.clone()).await,
            Err(AssemblyError::InvalidIndex { index: 3, total: 3 })
        ));
        assert!(matches!(
            assembler.put_chunk("../etc", 0, 1, None, payload.clone()).await,
            Err(AssemblyError::InvalidTransferId(_))
        ));
        assert!(matches!(
            assembler.merge("t1", "../escape", 1).await,
            Err(AssemblyError::InvalidFilename(_))
        ));

        assembler.put_chunk("t1", 0, 3, None, payload.clone()).await.unwrap();
        assert!(matches!(
            assembler.put_chunk("t1", 0, 4, None, payload).await,
            Err(AssemblyError::TotalMismatch { expected: 3, got: 4 })
        ));
    }

    #[tokio::test]
    async fn test_status_from_registry_and_disk() {
        let (dir, assembler) = setup();
        assert!(matches!(
            assembler.status("nobody", None).await,
            Err(AssemblyError::UnknownTransfer(_))
        ));

        assembler.put_chunk("t1", 1, 3, None, Bytes::from_static(b"x")).await.unwrap();
        let status = assembler.status("t1", None).await.unwrap();
        assert_eq!(status.received, vec![1]);
        assert_eq!(status.missing, vec![0, 2]);

        // A fresh process only has the files on disk.
        let restarted = ChunkAssembler::new(dir.path(), TransferRegistry::new());
        let status = restarted.status("t1", Some(3)).await.unwrap();
        assert_eq!(status.received, vec![1]);
        assert_eq!(status.missing, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_restarted_assembler_resumes_from_disk() {
        let (dir, before) = setup();
        before.put_chunk("t1", 0, 3, Some("big.zip"), Bytes::from_static(b"aa")).await.unwrap();
        before.put_chunk("t1", 1, 3, None, Bytes::from_static(b"bb")).await.unwrap();

        let after = ChunkAssembler::new(dir.path(), TransferRegistry::new());
        let status = after.put_chunk("t1", 2, 3, None, Bytes::from_static(b"cc")).await.unwrap();
        assert_eq!(status.received, vec![0, 1, 2]);
        assert!(status.missing.is_empty());
        assert!(status.complete);

        let status = after.status("t1", None).await.unwrap();
        assert!(status.complete);

        let merged = after.merge("t1", "big.zip", 3).await.unwrap();
        let bytes = fs::read(dir.path().join(&merged.stored_name)).await.unwrap();
        assert_eq!(bytes, b"aabbcc");
    }

    #[tokio::test]
    async fn test_merge_after_restart_keeps_disk_view() {
        let (dir, before) = setup();
        before.put_chunk("t1", 0, 3, None, Bytes::from_static(b"aa")).await.unwrap();
        before.put_chunk("t1", 2, 3, None, Bytes::from_static(b"cc")).await.unwrap();

        let after = ChunkAssembler::new(dir.path(), TransferRegistry::new());
        assert!(matches!(
            after.merge("t1", "big.zip", 3).await,
            Err(AssemblyError::MissingChunk(1))
        ));
        let status = after.status("t1", None).await.unwrap();
        assert_eq!(status.received, vec![0, 2]);
        assert_eq!(status.missing, vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_merge_racing_writers_is_serialized() {
        const BLOCK: usize = 4096;
        let (dir, assembler) = setup();
        let assembler = Arc::new(assembler);
        let total = 16u32;
        let block = |index: u32| Bytes::from(vec![index as u8; BLOCK]);

        for round in 0..8 {
            let id = format!("race-{round}");
            for index in 0..total - 1 {
                assembler.put_chunk(&id, index, total, None, block(index)).await.unwrap();
            }

            // The last chunk and rewrites of the others land while the merge runs.
            let mut writers = Vec::new();
            for index in (0..total).rev() {
                let assembler = assembler.clone();
                let id = id.clone();
                writers.push(tokio::spawn(async move {
                    assembler.put_chunk(&id, index, total, None, block(index)).await
                }));
            }
            let first = assembler.merge(&id, "out.bin", total).await;
            for writer in writers {
                writer.await.unwrap().unwrap();
            }

            let merged = match first {
                Ok(merged) => merged,
                Err(AssemblyError::MissingChunk(index)) => {
                    assert_eq!(index, total - 1);
                    assembler.merge(&id, "out.bin", total).await.unwrap()
                }
                Err(e) => panic!("unexpected merge error: {e}"),
            };

            let bytes = fs::read(dir.path().join(&merged.stored_name)).await.unwrap();
            assert_eq!(bytes.len(), BLOCK * total as usize);
            for (index, chunk) in bytes.chunks(BLOCK).enumerate() {
                assert!(chunk.iter().all(|b| *b == index as u8), "round {round} chunk {index}");
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_and_merge() {
        let (dir, assembler) = setup();
        let assembler = Arc::new(assembler);
        let total = 32u32;

        let mut writers = Vec::new();
        for index in 0..total {
            let assembler = assembler.clone();
            writers.push(tokio::spawn(async move {
                let payload = Bytes::from(vec![index as u8; 512]);
                assembler.put_chunk("race", index, total, None, payload).await
            }));
        }
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let (a, b) = tokio::join!(
            assembler.merge("race", "out.bin", total),
            assembler.merge("race", "out.bin", total)
        );
        // Exactly one merge wins; the other finds the chunks gone.
        let merged = match (a, b) {
            (Ok(m), Err(AssemblyError::MissingChunk(0))) | (Err(AssemblyError::MissingChunk(0)), Ok(m)) => m,
            other => panic!("unexpected merge outcomes: {other:?}"),
        };

        let bytes = fs::read(dir.path().join(&merged.stored_name)).await.unwrap();
        assert_eq!(bytes.len(), 512 * total as usize);
        for (index, block) in bytes.chunks(512).enumerate() {
            assert!(block.iter().all(|b| *b == index as u8));
        }
    }

    #[tokio::test]
    async fn test_store_upload() {
        let (dir, assembler) = setup();
        let body = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);

        let stored = assembler.store_upload("greeting.txt", body).await.unwrap();
        assert_eq!(stored.original_name, "greeting.txt");
        assert_eq!(stored.size, 11);
        let bytes = fs::read(dir.path().join(&stored.stored_name)).await.unwrap();
        assert_eq!(bytes, b"hello world");

        let empty = futures_util::stream::empty::<Result<Bytes, std::io::Error>>();
        assert!(matches!(
            assembler.store_upload("a/b.txt", empty).await,
            Err(AssemblyError::InvalidFilename(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_persist_removes_temp_file() {
        let (dir, _assembler) = setup();
        let partial = dir.path().join(temp_name("upload"));
        fs::write(&partial, b"payload").await.unwrap();
        let occupied = dir.path().join("occupied");
        fs::create_dir(&occupied).await.unwrap();
        fs::write(occupied.join("keep"), b"x").await.unwrap();

        assert!(persist(&partial, &occupied).await.is_err());
        assert!(!partial.exists());
        assert!(occupied.join("keep").exists());
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let (dir, assembler) = setup();
        assembler.put_chunk("idle", 0, 2, None, Bytes::from_static(b"x")).await.unwrap();
        fs::create_dir(dir.path().join("orphan")).await.unwrap();

        assert_eq!(assembler.purge_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(assembler.purge_stale(Duration::ZERO).await.unwrap(), 2);
        assert!(!dir.path().join("idle").exists());
        assert!(!dir.path().join("orphan").exists());
        assert_eq!(assembler.registry().stats().await.active, 0);
    }
}
