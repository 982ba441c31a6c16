//! Resumable upload receiver and direct upload staging.
//!
//! Sessions follow the tus 1.0.0 core protocol (plus the `creation` and
//! `termination` extensions). Each session owns two files in the store
//! directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `<id>` | Bytes received so far |
//! | `<id>.info` | JSON bookkeeping: declared length, offset, metadata |
//!
//! The recorded offset always equals the data file length. Appends to one
//! session are serialized by a per-session mutex; an append whose claimed
//! offset disagrees with the recorded one is rejected before anything is
//! written.
//!
//! When the offset reaches the declared length the completion hook moves the
//! bytes into the staging area, deletes the bookkeeping, and enqueues a
//! `PROCESS_ASSET` task, all before the final append returns.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use asset_vault_core::error::IoContext;
use asset_vault_core::metadata::{parse_upload_metadata, UploadMetadata};
use asset_vault_core::naming::{sanitize_folder_path, validate_owner_id};
use asset_vault_core::payload::{ProcessAssetPayload, TaskPayload};
use asset_vault_core::{VaultError, VaultResult};

use crate::queue::TaskQueue;
use crate::staging::{discard_file, move_file, remove_file_if_exists, StagingArea};

const CHUNK_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Largest declared upload length accepted.
    pub max_size: u64,
    /// Sessions without an append for this long are collected.
    pub idle_timeout: Duration,
}

/// Persisted session bookkeeping (`<id>.info`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    id: String,
    owner_id: String,
    length: u64,
    offset: u64,
    metadata: UploadMetadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

struct SessionState {
    info: SessionInfo,
    last_activity: Instant,
    /// Set once the session completed, was terminated, or was collected.
    closed: bool,
}

struct Session {
    owner_id: String,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(info: SessionInfo) -> Arc<Self> {
        Arc::new(Self {
            owner_id: info.owner_id.clone(),
            state: Mutex::new(SessionState {
                info,
                last_activity: Instant::now(),
                closed: false,
            }),
        })
    }
}

/// Offset report for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub id: String,
    pub offset: u64,
    pub length: u64,
}

/// Result of an accepted append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub offset: u64,
    pub length: u64,
    /// Set when this append completed the upload.
    pub task_id: Option<String>,
}

/// A file written to the staging area by the direct upload path.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
}

enum ChunkEnd {
    Drained,
    Overflow,
    Broken(io::Error),
    WriteFailed(io::Error),
}

pub struct UploadReceiver {
    store_dir: PathBuf,
    staging: StagingArea,
    queue: TaskQueue,
    options: UploadOptions,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl UploadReceiver {
    /// Open the store directory, restoring any sessions persisted there.
    pub async fn open(
        store_dir: impl Into<PathBuf>,
        staging: StagingArea,
        queue: TaskQueue,
        options: UploadOptions,
    ) -> VaultResult<Arc<Self>> {
        let store_dir = store_dir.into();
        tokio::fs::create_dir_all(&store_dir)
            .await
            .io_context(|| format!("creating upload store {}", store_dir.display()))?;

        let receiver = Arc::new(Self {
            store_dir,
            staging,
            queue,
            options,
            sessions: RwLock::new(HashMap::new()),
        });
        let restored = receiver.reload().await?;
        if restored > 0 {
            info!(restored, "upload sessions restored");
        }
        Ok(receiver)
    }

    pub fn max_size(&self) -> u64 {
        self.options.max_size
    }

    pub fn active_sessions(&self) -> usize {
        self.read_sessions().len()
    }

    // ============ Session lifecycle ============

    /// Start a session for `length` bytes described by an `Upload-Metadata` header.
    pub async fn create(
        &self,
        owner_id: &str,
        length: u64,
        metadata_header: &str,
    ) -> VaultResult<UploadStatus> {
        let owner_id = validate_owner_id(owner_id)?;
        if length == 0 {
            return Err(VaultError::Validation("upload length must be > 0".into()));
        }
        if length > self.options.max_size {
            return Err(VaultError::Validation(format!(
                "upload length {} exceeds the maximum of {}",
                length, self.options.max_size
            )));
        }
        let metadata = UploadMetadata::from_pairs(&parse_upload_metadata(metadata_header)?)?;
        sanitize_folder_path(&metadata.target_folder_path)?;

        let id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let info = SessionInfo {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            length,
            offset: 0,
            metadata,
            created_at: now,
            updated_at: now,
        };

        let data = self.data_path(&id);
        tokio::fs::File::create(&data)
            .await
            .io_context(|| format!("creating {}", data.display()))?;
        if let Err(e) = self.write_info(&info).await {
            discard_file(&data).await;
            return Err(e);
        }

        self.write_sessions().insert(id.clone(), Session::new(info));
        info!(upload_id = %id, owner_id, length, "upload session created");
        Ok(UploadStatus {
            id,
            offset: 0,
            length,
        })
    }

    pub async fn status(&self, owner_id: &str, id: &str) -> VaultResult<UploadStatus> {
        let session = self.lookup(owner_id, id)?;
        let state = session.state.lock().await;
        if state.closed {
            return Err(not_found(id));
        }
        Ok(UploadStatus {
            id: id.to_string(),
            offset: state.info.offset,
            length: state.info.length,
        })
    }

    /// Append the bytes from `body` at `claimed_offset`.
    ///
    /// Bytes that reach disk before the body breaks off still count toward the
    /// offset. A body carrying more than the remaining length is rejected and
    /// nothing from it is kept.
    pub async fn append<R>(
        &self,
        owner_id: &str,
        id: &str,
        claimed_offset: u64,
        mut body: R,
    ) -> VaultResult<AppendOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let session = self.lookup(owner_id, id)?;
        let mut state = session.state.lock().await;
        if state.closed {
            return Err(not_found(id));
        }
        if state.info.offset != claimed_offset {
            return Err(VaultError::OffsetConflict {
                expected: state.info.offset,
                claimed: claimed_offset,
            });
        }

        let start = state.info.offset;
        let remaining = state.info.length - start;
        let data = self.data_path(id);
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&data)
            .await
            .io_context(|| format!("opening {}", data.display()))?;

        let mut buf = vec![0u8; CHUNK_BUFFER];
        let mut written = 0u64;
        let mut end = loop {
            match body.read(&mut buf).await {
                Ok(0) => break ChunkEnd::Drained,
                Ok(n) => {
                    if written + n as u64 > remaining {
                        break ChunkEnd::Overflow;
                    }
                    if let Err(e) = file.write_all(&buf[..n]).await {
                        break ChunkEnd::WriteFailed(e);
                    }
                    written += n as u64;
                }
                Err(e) => break ChunkEnd::Broken(e),
            }
        };
        if let Err(e) = file.flush().await.and(file.sync_data().await) {
            end = ChunkEnd::WriteFailed(e);
        }
        if matches!(end, ChunkEnd::Overflow) {
            file.set_len(start)
                .await
                .io_context(|| format!("truncating {}", data.display()))?;
        }

        let on_disk = file
            .metadata()
            .await
            .io_context(|| format!("inspecting {}", data.display()))?
            .len();
        drop(file);

        state.info.offset = on_disk.min(state.info.length);
        state.info.updated_at = Utc::now();
        state.last_activity = Instant::now();
        self.write_info(&state.info).await?;
        debug!(upload_id = %id, offset = state.info.offset, written, "chunk appended");

        let reached_end = state.info.offset == state.info.length;
        match end {
            ChunkEnd::Overflow => {
                return Err(VaultError::Validation(format!(
                    "chunk exceeds the declared upload length of {}",
                    state.info.length
                )))
            }
            ChunkEnd::WriteFailed(e) => {
                return Err(e).io_context(|| format!("writing {}", data.display()))
            }
            ChunkEnd::Broken(e) if !reached_end => {
                return Err(VaultError::Transfer(format!(
                    "upload stream interrupted at offset {}: {}",
                    state.info.offset, e
                )))
            }
            _ => {}
        }

        let task_id = if reached_end {
            Some(self.complete(&mut state).await?)
        } else {
            None
        };
        Ok(AppendOutcome {
            offset: state.info.offset,
            length: state.info.length,
            task_id,
        })
    }

    /// Terminate a session, deleting its bytes and bookkeeping.
    pub async fn terminate(&self, owner_id: &str, id: &str) -> VaultResult<()> {
        let session = self.lookup(owner_id, id)?;
        let mut state = session.state.lock().await;
        if state.closed {
            return Err(not_found(id));
        }
        state.closed = true;
        self.forget(id);
        self.discard_session_files(id).await;
        info!(upload_id = %id, "upload terminated");
        Ok(())
    }

    /// Collect sessions idle longer than the configured window.
    ///
    /// Sessions with an append in flight are skipped.
    pub async fn collect_idle(&self) -> usize {
        let candidates: Vec<(String, Arc<Session>)> = self
            .read_sessions()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        let mut collected = 0;
        for (id, session) in candidates {
            let Ok(mut state) = session.state.try_lock() else {
                continue;
            };
            if state.closed || state.last_activity.elapsed() < self.options.idle_timeout {
                continue;
            }
            state.closed = true;
            self.forget(&id);
            self.discard_session_files(&id).await;
            debug!(upload_id = %id, "idle upload collected");
            collected += 1;
        }
        if collected > 0 {
            info!(collected, "idle upload sessions removed");
        }
        collected
    }

    /// Run [`collect_idle`](Self::collect_idle) every `every` until the receiver is dropped.
    pub fn spawn_gc(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(receiver) = weak.upgrade() else {
                    break;
                };
                receiver.collect_idle().await;
            }
        })
    }

    // ============ Completion ============

    /// Hand a fully received session over to ingestion. Returns the task id.
    ///
    /// On failure nothing of the session survives and the client must start over.
    async fn complete(&self, state: &mut SessionState) -> VaultResult<String> {
        let id = state.info.id.clone();
        state.closed = true;
        self.forget(&id);

        let staged = match self.staging.allocate(&state.info.owner_id, Utc::now()).await {
            Ok(path) => path,
            Err(e) => {
                self.discard_session_files(&id).await;
                return Err(e);
            }
        };
        if let Err(e) = move_file(&self.data_path(&id), &staged).await {
            warn!(upload_id = %id, error = %e, "moving completed upload failed");
            discard_file(&staged).await;
            self.discard_session_files(&id).await;
            return Err(e);
        }
        if let Err(e) = remove_file_if_exists(&self.info_path(&id)).await {
            warn!(upload_id = %id, error = %e, "removing upload bookkeeping failed");
            discard_file(&staged).await;
            return Err(e);
        }

        let meta = &state.info.metadata;
        let payload = ProcessAssetPayload {
            temp_file_path: staged.clone(),
            original_filename: meta.original_filename.clone(),
            project_id: meta.project_id.clone(),
            owner_id: state.info.owner_id.clone(),
            target_folder_path: meta.target_folder_path.clone(),
            size: state.info.length,
            mime_type: Some(meta.mime_type.clone()),
            uploaded_at: Utc::now(),
        };
        let task_id = self.queue.add_task(TaskPayload::ProcessAsset(payload)).await;
        info!(upload_id = %id, %task_id, staged = %staged.display(), "upload complete");
        Ok(task_id)
    }

    // ============ Direct uploads ============

    /// Stream `reader` into a new staging file for `owner_id`.
    ///
    /// The body is copied chunk by chunk and never held in memory as a whole.
    pub async fn stage_stream<R>(&self, owner_id: &str, reader: R) -> VaultResult<StagedFile>
    where
        R: AsyncRead + Unpin,
    {
        let owner_id = validate_owner_id(owner_id)?;
        let path = self.staging.allocate(owner_id, Utc::now()).await?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .io_context(|| format!("creating {}", path.display()))?;

        let mut limited = reader.take(self.options.max_size + 1);
        let copied = tokio::io::copy(&mut limited, &mut file).await;
        let synced = file.sync_data().await;
        drop(file);

        let size = match (copied, synced) {
            (Ok(n), Ok(())) => n,
            (Err(e), _) | (_, Err(e)) => {
                discard_file(&path).await;
                return Err(VaultError::Transfer(format!("upload stream failed: {}", e)));
            }
        };
        if size > self.options.max_size {
            discard_file(&path).await;
            return Err(VaultError::Validation(format!(
                "upload exceeds the maximum of {} bytes",
                self.options.max_size
            )));
        }
        debug!(path = %path.display(), size, "direct upload staged");
        Ok(StagedFile { path, size })
    }

    /// Enqueue ingestion of a file produced by [`stage_stream`](Self::stage_stream).
    pub async fn submit_staged(
        &self,
        owner_id: &str,
        staged: StagedFile,
        metadata: UploadMetadata,
    ) -> String {
        let payload = ProcessAssetPayload {
            temp_file_path: staged.path,
            original_filename: metadata.original_filename,
            project_id: metadata.project_id,
            owner_id: owner_id.to_string(),
            target_folder_path: metadata.target_folder_path,
            size: staged.size,
            mime_type: Some(metadata.mime_type).filter(|m| !m.is_empty()),
            uploaded_at: Utc::now(),
        };
        self.queue.add_task(TaskPayload::ProcessAsset(payload)).await
    }

    // ============ Bookkeeping ============

    fn data_path(&self, id: &str) -> PathBuf {
        self.store_dir.join(id)
    }

    fn info_path(&self, id: &str) -> PathBuf {
        self.store_dir.join(format!("{}.info", id))
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, id: &str) {
        self.write_sessions().remove(id);
    }

    /// Sessions are invisible to callers other than their owner.
    fn lookup(&self, owner_id: &str, id: &str) -> VaultResult<Arc<Session>> {
        let session = self.read_sessions().get(id).cloned().ok_or_else(|| not_found(id))?;
        if session.owner_id != owner_id.trim() {
            return Err(not_found(id));
        }
        Ok(session)
    }

    async fn write_info(&self, info: &SessionInfo) -> VaultResult<()> {
        let body = serde_json::to_vec_pretty(info)
            .map_err(|e| VaultError::io("encoding upload info", e.into()))?;
        let path = self.info_path(&info.id);
        let tmp = self.store_dir.join(format!("{}.info.tmp", info.id));
        tokio::fs::write(&tmp, body)
            .await
            .io_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .io_context(|| format!("replacing {}", path.display()))
    }

    async fn discard_session_files(&self, id: &str) {
        discard_file(&self.data_path(id)).await;
        discard_file(&self.info_path(id)).await;
    }

    /// Restore persisted sessions, reconciling each offset with its data file.
    async fn reload(&self) -> VaultResult<usize> {
        let mut entries = tokio::fs::read_dir(&self.store_dir)
            .await
            .io_context(|| format!("listing {}", self.store_dir.display()))?;

        let mut restored = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .io_context(|| format!("listing {}", self.store_dir.display()))?
        {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".info.tmp") {
                // Left behind by a crash between write and rename.
                discard_file(&path).await;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("info") {
                continue;
            }
            match self.restore(&path).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "dropping unreadable upload session"),
            }
        }
        Ok(restored)
    }

    async fn restore(&self, info_path: &Path) -> VaultResult<bool> {
        let raw = tokio::fs::read(info_path)
            .await
            .io_context(|| format!("reading {}", info_path.display()))?;
        let mut info: SessionInfo = match serde_json::from_slice(&raw) {
            Ok(info) => info,
            Err(e) => {
                discard_file(info_path).await;
                return Err(VaultError::io("decoding upload info", e.into()));
            }
        };
        if info_path != self.info_path(&info.id) {
            discard_file(info_path).await;
            return Ok(false);
        }

        let data = self.data_path(&info.id);
        let on_disk = match tokio::fs::metadata(&data).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                discard_file(info_path).await;
                return Ok(false);
            }
        };
        if on_disk > info.length {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&data)
                .await
                .io_context(|| format!("opening {}", data.display()))?;
            file.set_len(info.length)
                .await
                .io_context(|| format!("truncating {}", data.display()))?;
        }
        info.offset = on_disk.min(info.length);
        self.write_info(&info).await?;

        let id = info.id.clone();
        let session = Session::new(info);
        self.write_sessions().insert(id.clone(), session.clone());

        let mut state = session.state.lock().await;
        if state.info.offset == state.info.length {
            // Fully received before a restart but never handed over.
            self.complete(&mut state).await?;
            return Ok(false);
        }
        debug!(upload_id = %id, offset = state.info.offset, "upload session restored");
        Ok(true)
    }
}

fn not_found(id: &str) -> VaultError {
    VaultError::NotFound(format!("upload {}", id))
}
