//! Streaming of file and folder trees over an established connection.
//!
//! The sender announces the item count and byte total, then walks every
//! root depth-first in pre-order: a folder packet precedes its children,
//! a file packet is followed by the file bytes in fixed-size chunks. The
//! receiver trusts the declared relative paths and rebuilds the tree under
//! its save directory.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use lanpush_core::crypto::EncryptionContext;
use lanpush_core::error::TransferError;
use lanpush_core::listener::Connection;
use lanpush_core::protocol::{ITEM_INFO_LEN, ItemKind, Packet, TRANSFER_INFO_LEN};

use crate::events::{Direction, EngineEvent, EventBus, TransferProgress};
use crate::link::Link;

/// Longest destination path the receiver will create, in bytes.
pub const MAX_PATH_BYTES: usize = 4096;
/// Longest single path component the receiver will create, in bytes.
pub const MAX_COMPONENT_BYTES: usize = 255;

// ── Plan ────────────────────────────────────────────────────────────

/// One entry of a [`TransferPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    pub kind: ItemKind,
    /// File size in bytes, 0 for folders.
    pub size: u64,
    pub source: PathBuf,
    /// `/`-separated path relative to the parent of the root it came from.
    pub relative: String,
}

/// Snapshot of everything a send will stream, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    items: Vec<PlannedItem>,
    total_size: u64,
}

impl TransferPlan {
    /// Walks `roots` recursively. Children are visited in name order.
    ///
    /// This touches the filesystem synchronously; run it off the async
    /// executor.
    ///
    /// # Errors
    ///
    /// Fails when a root or a child cannot be inspected or has a name that
    /// is not valid UTF-8.
    pub fn build(roots: &[PathBuf]) -> Result<Self, TransferError> {
        let mut plan = Self::default();
        for root in roots {
            let name = utf8_name(root)?;
            plan.walk(root, name)?;
        }
        u32::try_from(plan.items.len())
            .map_err(|_| TransferError::Send(format!("too many items: {}", plan.items.len())))?;
        Ok(plan)
    }

    fn walk(&mut self, path: &Path, relative: String) -> Result<(), TransferError> {
        let meta = std::fs::metadata(path).map_err(|e| unreadable(path, &e))?;
        if !meta.is_dir() {
            self.total_size += meta.len();
            self.items.push(PlannedItem {
                kind: ItemKind::File,
                size: meta.len(),
                source: path.to_path_buf(),
                relative,
            });
            return Ok(());
        }

        self.items.push(PlannedItem {
            kind: ItemKind::Folder,
            size: 0,
            source: path.to_path_buf(),
            relative: relative.clone(),
        });

        let mut children = std::fs::read_dir(path)
            .map_err(|e| unreadable(path, &e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| unreadable(path, &e))?;
        children.sort();

        for child in children {
            let name = utf8_name(&child)?;
            self.walk(&child, format!("{relative}/{name}"))?;
        }
        Ok(())
    }

    pub fn items(&self) -> &[PlannedItem] {
        &self.items
    }

    #[allow(clippy::cast_possible_truncation)] // checked in `build`
    pub fn item_count(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

fn utf8_name(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| TransferError::Send(format!("unsupported file name: {}", path.display())))
}

fn unreadable(path: &Path, e: &std::io::Error) -> TransferError {
    TransferError::Send(format!("cannot read {}: {e}", path.display()))
}

// ── Progress ────────────────────────────────────────────────────────

/// Publishes [`EngineEvent::Progress`] at most once per percent of the
/// total, plus once per finished item and once at the end.
#[derive(Debug)]
pub struct ProgressTracker {
    events: EventBus,
    direction: Direction,
    active_item: String,
    total: u64,
    done: u64,
    last_reported: u64,
}

impl ProgressTracker {
    pub fn new(events: EventBus, direction: Direction) -> Self {
        Self {
            events,
            direction,
            active_item: String::new(),
            total: 0,
            done: 0,
            last_reported: 0,
        }
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn start_item(&mut self, relative: &str) {
        self.active_item = relative.rsplit('/').next().unwrap_or(relative).to_string();
    }

    pub fn advance(&mut self, bytes: u64) {
        self.done += bytes;
        if self.done >= self.last_reported + (self.total / 100).max(1) {
            self.report(false);
        }
    }

    pub fn item_finished(&mut self) {
        self.report(false);
    }

    /// Final report of the session, forced to 100 %.
    pub fn finish(&mut self) {
        self.report(true);
    }

    pub fn snapshot(&self, completed: bool) -> TransferProgress {
        TransferProgress {
            active_item: self.active_item.clone(),
            bytes_done: self.done,
            total_bytes: self.total,
            direction: self.direction,
            completed,
        }
    }

    fn report(&mut self, completed: bool) {
        self.last_reported = self.done;
        self.events
            .publish(EngineEvent::Progress(self.snapshot(completed)));
    }
}

// ── Sender ──────────────────────────────────────────────────────────

/// Streams `plan` over `link`.
///
/// File chunks are exactly `chunk_size` bytes except the last one of each
/// file, so a receiver using the same chunk size can size its reads.
///
/// # Errors
///
/// Any I/O failure aborts the whole send.
pub async fn send_plan<C: Connection>(
    link: &mut Link<'_, C>,
    plan: &TransferPlan,
    cipher: Option<&EncryptionContext>,
    chunk_size: usize,
    progress: &mut ProgressTracker,
) -> Result<(), TransferError> {
    progress.set_total(plan.total_size());
    link.send_sealed(
        &Packet::TransferInfo {
            item_count: plan.item_count(),
            total_size: plan.total_size(),
        },
        cipher,
    )
    .await?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    for item in plan.items() {
        debug!(path = %item.relative, kind = ?item.kind, size = item.size, "Sending item");
        progress.start_item(&item.relative);
        link.send_sealed(
            &Packet::ItemInfo {
                kind: item.kind,
                size: item.size,
                path: item.relative.clone(),
            },
            cipher,
        )
        .await
        .map_err(TransferError::from)
        .map_err(|e| match e {
            // The codec reports an oversized path as a malformed packet.
            TransferError::Receive(msg) => TransferError::Send(msg),
            e => e,
        })?;

        if item.kind == ItemKind::File {
            let mut file = File::open(&item.source)
                .await
                .map_err(|e| unreadable(&item.source, &e))?;
            let mut remaining = item.size;
            while remaining > 0 {
                let want = chunk_len(remaining, buf.len());
                file.read_exact(&mut buf[..want])
                    .await
                    .map_err(|e| unreadable(&item.source, &e))?;
                link.send_chunk(&buf[..want], cipher).await?;
                remaining -= want as u64;
                progress.advance(want as u64);
            }
        }
        progress.item_finished();
    }
    Ok(())
}

fn chunk_len(remaining: u64, chunk_size: usize) -> usize {
    usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size))
}

/// Human-readable summary of a finished send.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn send_summary(item_count: u32, bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(0.001);
    format!(
        "Sent {item_count} item(s), {bytes} bytes in {secs:.2} s ({:.1} KiB/s)",
        bytes as f64 / 1024.0 / secs
    )
}

// ── Receiver ────────────────────────────────────────────────────────

/// What a receive produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    pub item_count: u32,
    pub total_size: u64,
    /// Files whose destination path was too long; their bytes were discarded.
    pub skipped: Vec<PathBuf>,
}

/// Reads a whole transfer from `link` and rebuilds it under `save_dir`.
///
/// # Errors
///
/// Aborts on I/O failures, malformed packets, unsafe relative paths and
/// directories that cannot be created. Files whose destination path is
/// too long are skipped and logged instead.
pub async fn receive_items<C: Connection>(
    link: &mut Link<'_, C>,
    save_dir: &Path,
    cipher: Option<&EncryptionContext>,
    chunk_size: usize,
    progress: &mut ProgressTracker,
    events: &EventBus,
) -> Result<ReceiveReport, TransferError> {
    let chunk_size = chunk_size.max(1);
    let (item_count, total_size) = match link.recv_sealed(TRANSFER_INFO_LEN, cipher).await? {
        Packet::TransferInfo {
            item_count,
            total_size,
        } => (item_count, total_size),
        other => return Err(unexpected(&other)),
    };
    debug!(item_count, total_size, "Receiving transfer");
    progress.set_total(total_size);

    let mut report = ReceiveReport {
        item_count,
        total_size,
        skipped: Vec::new(),
    };
    for _ in 0..item_count {
        let (kind, size, path) = match link.recv_sealed(ITEM_INFO_LEN, cipher).await? {
            Packet::ItemInfo { kind, size, path } => (kind, size, path),
            other => return Err(unexpected(&other)),
        };
        let dest = save_dir.join(sanitize_relative(&path)?);
        progress.start_item(&path);

        match kind {
            ItemKind::Folder => create_dir(&dest).await?,
            ItemKind::File => {
                if let Some(parent) = dest.parent() {
                    create_dir(parent).await?;
                }
                if path_too_long(&dest) {
                    let err = TransferError::PathTooLong(dest.clone());
                    events.error(err.to_string());
                    drain(link, size, chunk_size, cipher, progress).await?;
                    report.skipped.push(dest);
                } else {
                    receive_file(link, &dest, size, chunk_size, cipher, progress).await?;
                }
            }
        }
        progress.item_finished();
    }
    Ok(report)
}

async fn receive_file<C: Connection>(
    link: &mut Link<'_, C>,
    dest: &Path,
    size: u64,
    chunk_size: usize,
    cipher: Option<&EncryptionContext>,
    progress: &mut ProgressTracker,
) -> Result<(), TransferError> {
    let mut file = File::create(dest)
        .await
        .map_err(|e| TransferError::Receive(format!("cannot create {}: {e}", dest.display())))?;

    let streamed = async {
        let mut remaining = size;
        while remaining > 0 {
            let want = chunk_len(remaining, chunk_size);
            let chunk = link.recv_chunk(want, cipher).await?;
            file.write_all(&chunk).await.map_err(|e| {
                TransferError::Receive(format!("cannot write {}: {e}", dest.display()))
            })?;
            remaining -= want as u64;
            progress.advance(want as u64);
        }
        Ok::<(), TransferError>(())
    }
    .await;

    // Partial files are kept, so flush on every path.
    let flushed = file.flush().await;
    streamed?;
    flushed.map_err(|e| TransferError::Receive(format!("cannot write {}: {e}", dest.display())))
}

async fn drain<C: Connection>(
    link: &mut Link<'_, C>,
    size: u64,
    chunk_size: usize,
    cipher: Option<&EncryptionContext>,
    progress: &mut ProgressTracker,
) -> Result<(), TransferError> {
    let mut remaining = size;
    while remaining > 0 {
        let want = chunk_len(remaining, chunk_size);
        link.recv_chunk(want, cipher).await?;
        remaining -= want as u64;
        progress.advance(want as u64);
    }
    Ok(())
}

async fn create_dir(path: &Path) -> Result<(), TransferError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| TransferError::DirectoryCreate {
            path: path.to_path_buf(),
            source,
        })
}

fn unexpected(packet: &Packet) -> TransferError {
    TransferError::Receive(format!("unexpected packet {:?}", packet.opcode()))
}

/// Turns a declared `/`-separated path into a relative [`PathBuf`].
///
/// Empty, `.`, `..` and absolute components are rejected.
pub fn sanitize_relative(declared: &str) -> Result<PathBuf, TransferError> {
    let mut out = PathBuf::new();
    for part in declared.split('/') {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => out.push(name),
            _ => {
                warn!(path = %declared, "Rejecting unsafe item path");
                return Err(TransferError::Receive(format!(
                    "unsafe item path: {declared:?}"
                )));
            }
        }
    }
    Ok(out)
}

fn path_too_long(path: &Path) -> bool {
    path.as_os_str().len() > MAX_PATH_BYTES
        || path
            .components()
            .any(|c| c.as_os_str().len() > MAX_COMPONENT_BYTES)
}
