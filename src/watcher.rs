use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{extension_of, ExtensionSets};

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Watches the media root recursively and nudges the rescan loop when
/// anything relevant changes. Deliberately coarse: the rescan rebuilds the
/// whole catalog, so the only information a change event needs to carry is
/// "something happened".
pub struct ChangeWatcher {
    // Dropping the debouncer stops the watch; keep it alive with the server.
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

impl ChangeWatcher {
    /// Start watching `media_dir`. Events touching media or subtitle files
    /// (or directories, which may contain them) send a unit on `trigger`;
    /// the channel is bounded so bursts coalesce into one pending rescan.
    pub fn start(
        media_dir: &Path,
        extensions: Arc<ExtensionSets>,
        trigger: mpsc::Sender<()>,
    ) -> Result<Self> {
        let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let relevant = events
                        .iter()
                        .flat_map(|event| event.event.paths.iter())
                        .any(|path| is_relevant(path, &extensions));
                    if relevant {
                        debug!("Media change detected, scheduling rescan");
                        // try_send: a rescan already pending absorbs this one.
                        let _ = trigger.try_send(());
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!("File watcher error: {error}");
                    }
                }
            }
        })
        .context("Failed to create file watcher")?;

        debouncer
            .watcher()
            .watch(media_dir, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", media_dir.display()))?;

        info!("Watching {} for media changes", media_dir.display());
        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// A path matters if it is (or was, for deletions) a media or subtitle file,
/// or a directory that might hold them. Deleted paths no longer exist on
/// disk, so a path without a recognized extension is treated as a directory.
fn is_relevant(path: &Path, extensions: &ExtensionSets) -> bool {
    match extension_of(path) {
        Some(ext) => extensions.is_supported(&ext) || extensions.is_subtitle(&ext),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn extension_sets() -> ExtensionSets {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        ExtensionSets::from_config(&config)
    }

    #[test]
    fn media_and_subtitle_files_are_relevant() {
        let sets = extension_sets();
        assert!(is_relevant(Path::new("/media/movie.mp4"), &sets));
        assert!(is_relevant(Path::new("/media/movie.MKV"), &sets));
        assert!(is_relevant(Path::new("/media/movie.srt"), &sets));
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let sets = extension_sets();
        assert!(!is_relevant(Path::new("/media/notes.txt"), &sets));
        assert!(!is_relevant(Path::new("/media/cover.jpg"), &sets));
    }

    #[test]
    fn extensionless_paths_count_as_directories() {
        let sets = extension_sets();
        assert!(is_relevant(Path::new("/media/new-season"), &sets));
    }

    #[tokio::test]
    async fn file_creation_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let sets = Arc::new(ExtensionSets::from_config(&config));
        let (tx, mut rx) = mpsc::channel(1);

        let _watcher = ChangeWatcher::start(dir.path(), sets, tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("movie.mp4"), b"data").unwrap();

        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("watcher never fired")
            .expect("trigger channel closed");
    }
}
