use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::config::{extension_of, ExtensionSets};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("media directory does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("media directory is not readable: {path}")]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A sidecar caption file attached to exactly one video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtitleEntry {
    pub path: String,
    pub lang: String,
    pub label: String,
}

/// One discovered media file. Identity is the slash-normalized relative `path`.
#[derive(Debug, Clone, Serialize)]
pub struct VideoEntry {
    pub name: String,
    pub filename: String,
    pub path: String,
    pub size: u64,
    pub size_display: String,
    pub extension: String,
    pub playable: bool,
    pub folder: String,
    pub subtitles: Vec<SubtitleEntry>,
}

/// Immutable snapshot of the scanned collection. Rebuilt wholesale on every
/// scan and swapped in atomically; readers never see a half-built catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub videos: Vec<VideoEntry>,
    pub folders: Vec<String>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self {
            videos: Vec::new(),
            folders: Vec::new(),
            generated_at: chrono::Utc::now(),
        }
    }

    pub fn from_videos(videos: Vec<VideoEntry>) -> Self {
        let mut folders: Vec<String> = videos
            .iter()
            .map(|v| v.folder.clone())
            .filter(|f| !f.is_empty())
            .collect();
        folders.sort();
        folders.dedup();

        Self {
            videos,
            folders,
            generated_at: chrono::Utc::now(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&VideoEntry> {
        self.videos.iter().find(|v| v.path == path)
    }

    pub fn playable_count(&self) -> usize {
        self.videos.iter().filter(|v| v.playable).count()
    }

    /// Relative paths of all entries, in catalog order. Used to detect whether
    /// a rescan actually changed anything worth republishing.
    pub fn paths(&self) -> Vec<&str> {
        self.videos.iter().map(|v| v.path.as_str()).collect()
    }
}

/// Recursively scan `root` and build a catalog of video and sidecar subtitle
/// files. Unreadable subtrees are skipped with a warning; only a missing or
/// unreadable root is an error.
pub async fn scan(root: &Path, extensions: &ExtensionSets) -> Result<Catalog, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::MissingRoot(root.to_path_buf()));
    }

    // Probe readability up front so a bad root fails loudly instead of
    // producing a silently empty catalog.
    std::fs::read_dir(root).map_err(|source| ScanError::UnreadableRoot {
        path: root.to_path_buf(),
        source,
    })?;

    let mut videos: Vec<VideoEntry> = Vec::new();
    let mut subtitles: Vec<(String, String, PathBuf)> = Vec::new();

    // Breadth-first with per-directory sorted entries so two scans of an
    // unchanged tree produce identical catalogs.
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let mut entries = match read_dir_sorted(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };

        for path in entries.drain(..) {
            if path.is_dir() {
                queue.push_back(path);
                continue;
            }

            let Some(ext) = extension_of(&path) else {
                continue;
            };

            if extensions.is_supported(&ext) {
                match build_entry(root, &path, &ext, extensions).await {
                    Ok(entry) => videos.push(entry),
                    Err(e) => warn!("Skipping unreadable file {}: {}", path.display(), e),
                }
            } else if extensions.is_subtitle(&ext) {
                let rel = relative_slash_path(root, &path);
                let folder = parent_folder(&rel);
                subtitles.push((folder, rel, path));
            }
        }
    }

    attach_subtitles(&mut videos, &subtitles);

    Ok(Catalog::from_videos(videos))
}

async fn read_dir_sorted(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

async fn build_entry(
    root: &Path,
    path: &Path,
    ext: &str,
    extensions: &ExtensionSets,
) -> std::io::Result<VideoEntry> {
    let metadata = tokio::fs::metadata(path).await?;
    let size = metadata.len();

    let rel = relative_slash_path(root, path);
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(VideoEntry {
        name: display_name(&stem),
        filename,
        path: rel.clone(),
        size,
        size_display: format_size(size),
        extension: ext.to_string(),
        playable: extensions.is_playable(ext),
        folder: parent_folder(&rel),
        subtitles: Vec::new(),
    })
}

fn attach_subtitles(videos: &mut [VideoEntry], subtitles: &[(String, String, PathBuf)]) {
    if subtitles.is_empty() {
        return;
    }

    // Keyed by (folder, lowercased video stem) for case-insensitive matching.
    let mut by_key: HashMap<(String, String), Vec<SubtitleEntry>> = HashMap::new();

    for (folder, rel, path) in subtitles {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (base, lang) = split_lang_suffix(&stem);
        let label = if lang == "und" {
            "Subtitles".to_string()
        } else {
            lang.to_uppercase()
        };
        by_key
            .entry((folder.clone(), base.to_lowercase()))
            .or_default()
            .push(SubtitleEntry {
                path: rel.clone(),
                lang,
                label,
            });
    }

    for video in videos.iter_mut() {
        let stem = Path::new(&video.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if let Some(mut subs) = by_key.remove(&(video.folder.clone(), stem)) {
            subs.sort_by(|a, b| a.path.cmp(&b.path));
            video.subtitles = subs;
        }
    }
}

/// `movie.eng` -> (`movie`, `eng`); a stem without a recognizable language
/// suffix keeps its full name and gets `und`.
fn split_lang_suffix(stem: &str) -> (String, String) {
    if let Some((base, suffix)) = stem.rsplit_once('.') {
        let is_lang = (2..=3).contains(&suffix.len())
            && suffix.chars().all(|c| c.is_ascii_alphabetic())
            && !base.is_empty();
        if is_lang {
            return (base.to_string(), suffix.to_lowercase());
        }
    }
    (stem.to_string(), "und".to_string())
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_folder(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((folder, _)) => folder.to_string(),
        None => String::new(),
    }
}

/// Human-friendly display name: extension already stripped, separators
/// normalized to single spaces.
fn display_name(stem: &str) -> String {
    stem.replace(['.', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let size = size_bytes as f64;
    if size < KB {
        format!("{size_bytes} B")
    } else if size < MB {
        format!("{:.1} KB", size / KB)
    } else if size < GB {
        format!("{:.1} MB", size / MB)
    } else {
        format!("{:.2} GB", size / GB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, ExtensionSets};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ExtensionSets) {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let sets = ExtensionSets::from_config(&config);
        (dir, sets)
    }

    #[tokio::test]
    async fn scan_missing_root_fails() {
        let (dir, sets) = setup();
        let missing = dir.path().join("nope");
        assert!(matches!(
            scan(&missing, &sets).await,
            Err(ScanError::MissingRoot(_))
        ));
    }

    #[tokio::test]
    async fn scan_builds_entries_with_folders() {
        let (dir, sets) = setup();
        fs::write(dir.path().join("intro.mp4"), b"abcd").unwrap();
        fs::create_dir_all(dir.path().join("series/season1")).unwrap();
        fs::write(dir.path().join("series/season1/ep01.mkv"), b"abcdefgh").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let catalog = scan(dir.path(), &sets).await.unwrap();
        assert_eq!(catalog.videos.len(), 2);

        let intro = catalog.get("intro.mp4").unwrap();
        assert_eq!(intro.folder, "");
        assert_eq!(intro.extension, ".mp4");
        assert!(intro.playable);
        assert_eq!(intro.size, 4);

        let ep = catalog.get("series/season1/ep01.mkv").unwrap();
        assert_eq!(ep.folder, "series/season1");
        assert!(!ep.playable);
        assert_eq!(catalog.folders, vec!["series/season1".to_string()]);
    }

    #[tokio::test]
    async fn scan_is_deterministic() {
        let (dir, sets) = setup();
        fs::write(dir.path().join("b.mp4"), b"bb").unwrap();
        fs::write(dir.path().join("a.mp4"), b"aa").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.mkv"), b"cc").unwrap();

        let first = scan(dir.path(), &sets).await.unwrap();
        let second = scan(dir.path(), &sets).await.unwrap();

        assert_eq!(first.paths(), second.paths());
        for (a, b) in first.videos.iter().zip(second.videos.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.size, b.size);
            assert_eq!(a.size_display, b.size_display);
            assert_eq!(a.playable, b.playable);
            assert_eq!(a.subtitles, b.subtitles);
        }
    }

    #[tokio::test]
    async fn scan_picks_up_added_and_removed_files() {
        let (dir, sets) = setup();
        fs::write(dir.path().join("keep.mp4"), b"k").unwrap();
        fs::write(dir.path().join("gone.mp4"), b"g").unwrap();

        let before = scan(dir.path(), &sets).await.unwrap();
        assert_eq!(before.videos.len(), 2);

        fs::remove_file(dir.path().join("gone.mp4")).unwrap();
        fs::write(dir.path().join("new.mkv"), b"n").unwrap();

        let after = scan(dir.path(), &sets).await.unwrap();
        assert!(after.get("gone.mp4").is_none());
        assert!(after.get("keep.mp4").is_some());
        assert!(after.get("new.mkv").is_some());
        assert_eq!(after.videos.len(), 2);
    }

    #[tokio::test]
    async fn subtitles_attach_by_base_name() {
        let (dir, sets) = setup();
        fs::write(dir.path().join("movie.mkv"), b"m").unwrap();
        fs::write(dir.path().join("movie.eng.srt"), b"s").unwrap();
        fs::write(dir.path().join("movie.srt"), b"s").unwrap();
        fs::write(dir.path().join("other.srt"), b"s").unwrap();

        let catalog = scan(dir.path(), &sets).await.unwrap();
        let movie = catalog.get("movie.mkv").unwrap();
        assert_eq!(movie.subtitles.len(), 2);

        let eng = movie
            .subtitles
            .iter()
            .find(|s| s.path == "movie.eng.srt")
            .unwrap();
        assert_eq!(eng.lang, "eng");
        assert_eq!(eng.label, "ENG");

        let plain = movie
            .subtitles
            .iter()
            .find(|s| s.path == "movie.srt")
            .unwrap();
        assert_eq!(plain.lang, "und");
        assert_eq!(plain.label, "Subtitles");
    }

    #[tokio::test]
    async fn subtitle_match_is_case_insensitive() {
        let (dir, sets) = setup();
        fs::write(dir.path().join("Movie.mkv"), b"m").unwrap();
        fs::write(dir.path().join("movie.SRT"), b"s").unwrap();

        let catalog = scan(dir.path(), &sets).await.unwrap();
        let movie = catalog.get("Movie.mkv").unwrap();
        assert_eq!(movie.subtitles.len(), 1);
    }

    #[test]
    fn split_lang_suffix_cases() {
        assert_eq!(
            split_lang_suffix("movie.eng"),
            ("movie".to_string(), "eng".to_string())
        );
        assert_eq!(
            split_lang_suffix("movie.en"),
            ("movie".to_string(), "en".to_string())
        );
        assert_eq!(
            split_lang_suffix("movie.2024"),
            ("movie.2024".to_string(), "und".to_string())
        );
        assert_eq!(
            split_lang_suffix("movie"),
            ("movie".to_string(), "und".to_string())
        );
    }

    #[test]
    fn display_name_normalizes_separators() {
        assert_eq!(display_name("Some_Movie.2019.1080p"), "Some Movie 2019 1080p");
        assert_eq!(display_name("plain"), "plain");
    }

    #[test]
    fn format_size_uses_binary_prefixes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(1288490188), "1.20 GB");
    }
}
