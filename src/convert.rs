use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{format_size, Catalog, VideoEntry};
use crate::config::{Config, ExtensionSets};
use crate::state::AppState;

const TARGET_EXTENSION: &str = ".mp4";

/// A queued transcode of one source file.
#[derive(Debug)]
pub struct ConversionJob {
    /// Slash-normalized path relative to the media root; the dedupe key.
    pub rel_path: String,
    pub source: PathBuf,
}

/// Producer handle for the conversion queue. Cloned by the scan task and any
/// other producer; enqueueing is idempotent per source path until the worker
/// finishes that job, and a path that failed once stays out of the queue for
/// the life of the process.
#[derive(Clone)]
pub struct ConversionQueue {
    tx: mpsc::UnboundedSender<ConversionJob>,
    pending: Arc<Mutex<HashSet<String>>>,
    failed: Arc<Mutex<HashSet<String>>>,
}

impl ConversionQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConversionJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(Mutex::new(HashSet::new())),
                failed: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Queue `entry` for conversion if its extension needs it, its mp4
    /// counterpart does not already exist, no job for the same path is queued
    /// or running, and the path has not already failed. Returns whether a job
    /// was actually added.
    pub fn enqueue(&self, entry: &VideoEntry, media_dir: &Path, extensions: &ExtensionSets) -> bool {
        if !extensions.needs_conversion(&entry.extension) {
            return false;
        }

        // A sibling mp4 on disk means the file was converted before (or a
        // distinct playable version exists); overwriting it would also leave
        // two catalog entries with the same path.
        let target = media_dir.join(replace_extension(&entry.path, TARGET_EXTENSION));
        if target.exists() {
            debug!("Skipping {}: target {} already exists", entry.path, target.display());
            return false;
        }

        if self.failed.lock().expect("failed set lock poisoned").contains(&entry.path) {
            return false;
        }

        {
            let mut pending = self.pending.lock().expect("pending set lock poisoned");
            if !pending.insert(entry.path.clone()) {
                return false;
            }
        }

        let job = ConversionJob {
            rel_path: entry.path.clone(),
            source: media_dir.join(Path::new(&entry.path)),
        };

        if self.tx.send(job).is_err() {
            // Worker is gone (shutdown); forget the reservation.
            self.pending
                .lock()
                .expect("pending set lock poisoned")
                .remove(&entry.path);
            return false;
        }

        info!("Queued for conversion: {}", entry.path);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending set lock poisoned").len()
    }

    fn finish(&self, rel_path: &str) {
        self.pending
            .lock()
            .expect("pending set lock poisoned")
            .remove(rel_path);
    }

    /// Record a permanent failure. Failures are not retried automatically;
    /// the path is refused by `enqueue` until the server restarts.
    fn fail(&self, rel_path: &str) {
        self.finish(rel_path);
        self.failed
            .lock()
            .expect("failed set lock poisoned")
            .insert(rel_path.to_string());
    }
}

/// Single consumer of the conversion queue. Jobs run strictly one at a time;
/// the transcoder is IO and CPU heavy and running several would thrash the
/// disk the server is streaming from.
pub struct ConversionWorker {
    state: AppState,
    queue: ConversionQueue,
    rx: mpsc::UnboundedReceiver<ConversionJob>,
    cancel: CancellationToken,
}

impl ConversionWorker {
    pub fn new(
        state: AppState,
        queue: ConversionQueue,
        rx: mpsc::UnboundedReceiver<ConversionJob>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            queue,
            rx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let ffmpeg_available = self.probe_ffmpeg().await;
        if !ffmpeg_available {
            warn!(
                "'{}' not found; conversion is disabled, non-playable files will be served as-is",
                self.state.config.convert.ffmpeg
            );
        } else {
            info!("Conversion worker started");
        }

        loop {
            let job = tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            if !ffmpeg_available {
                self.queue.finish(&job.rel_path);
                continue;
            }

            info!("Converting {}", job.rel_path);
            match self.process(&job).await {
                Ok(()) => {
                    info!("Conversion finished: {}", job.rel_path);
                    self.queue.finish(&job.rel_path);
                }
                Err(e) => {
                    error!("Conversion failed for {}: {e:#}", job.rel_path);
                    self.queue.fail(&job.rel_path);
                }
            }
        }

        info!("Conversion worker stopped");
    }

    async fn probe_ffmpeg(&self) -> bool {
        Command::new(&self.state.config.convert.ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Convert one file: video stream copied, audio re-encoded to AAC, output
    /// written to a temporary path first. The source is renamed to `.bak`
    /// (never deleted) only after the output is fully written, then the
    /// catalog entry is patched in place without a full rescan.
    pub async fn process(&self, job: &ConversionJob) -> Result<()> {
        let target = job.source.with_extension("mp4");
        let tmp = job.source.with_extension("mp4.tmp");

        // Enqueue already filters these; re-check here in case the target
        // appeared while the job sat in the queue.
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            anyhow::bail!("Target already exists: {}", target.display());
        }

        let result = self.transcode(&job.source, &tmp).await;
        if let Err(e) = result {
            // A half-written temporary output must never survive.
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        let backup = backup_path(&job.source);
        tokio::fs::rename(&job.source, &backup)
            .await
            .with_context(|| format!("Failed to rename original to {}", backup.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            // Roll the original back so the catalog stays truthful.
            let _ = tokio::fs::rename(&backup, &job.source).await;
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to move output to {}", target.display()));
        }

        let new_size = tokio::fs::metadata(&target)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        self.patch_catalog(&job.rel_path, new_size).await;
        Ok(())
    }

    async fn transcode(&self, source: &Path, tmp: &Path) -> Result<()> {
        let convert = &self.state.config.convert;
        let mut child = Command::new(&convert.ffmpeg)
            .arg("-i")
            .arg(source)
            .args(["-c:v", "copy"])
            .args(["-c:a", "aac"])
            .args(["-b:a", &convert.audio_bitrate])
            .args(["-movflags", "+faststart"])
            .arg("-y")
            .arg(tmp)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start '{}'", convert.ffmpeg))?;

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait on transcoder")?,
            _ = self.cancel.cancelled() => {
                let _ = child.kill().await;
                anyhow::bail!("Conversion cancelled by shutdown");
            }
        };

        if !status.success() {
            anyhow::bail!("Transcoder exited with {status}");
        }
        Ok(())
    }

    /// Swap in a new catalog snapshot with the converted entry updated:
    /// new extension and path, playable, refreshed size. Subtitles carry over.
    async fn patch_catalog(&self, rel_path: &str, new_size: u64) {
        let current = self.state.catalog().await;

        let videos: Vec<VideoEntry> = current
            .videos
            .iter()
            .map(|entry| {
                if entry.path != rel_path {
                    return entry.clone();
                }
                let mut updated = entry.clone();
                updated.path = replace_extension(&entry.path, TARGET_EXTENSION);
                updated.filename = replace_extension(&entry.filename, TARGET_EXTENSION);
                updated.extension = TARGET_EXTENSION.to_string();
                updated.playable = true;
                updated.size = new_size;
                updated.size_display = format_size(new_size);
                updated
            })
            .collect();

        self.state.install_catalog(Catalog::from_videos(videos)).await;
    }
}

/// `movie.mkv` -> `movie.mkv.bak`.
fn backup_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

fn replace_extension(path: &str, new_ext: &str) -> String {
    match path.rfind('.') {
        Some(idx) => format!("{}{}", &path[..idx], new_ext),
        None => format!("{path}{new_ext}"),
    }
}

/// Offer every conversion candidate in `catalog` to the queue. Called after
/// each scan; the queue's dedupe makes repeated offers idempotent.
pub fn enqueue_candidates(
    queue: &ConversionQueue,
    catalog: &Catalog,
    config: &Config,
    extensions: &ExtensionSets,
) -> usize {
    catalog
        .videos
        .iter()
        .filter(|entry| queue.enqueue(entry, &config.media_dir, extensions))
        .count()
}
