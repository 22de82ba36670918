use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Override the listening port from the config file
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the media directory from the config file
    #[arg(short, long)]
    pub media_dir: Option<PathBuf>,
}

/// Main application configuration, loaded from a TOML file.
///
/// `media_dir`, `port`, the publish credentials and the extension sets are
/// required; a missing key is a startup error, not a silent default.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub media_dir: PathBuf,
    pub port: u16,
    pub supported_extensions: Vec<String>,
    pub playable_extensions: Vec<String>,
    pub rescan_interval_secs: u64,
    #[serde(default = "default_subtitle_extensions")]
    pub subtitle_extensions: Vec<String>,
    pub publish: PublishConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
}

/// Remote document to keep updated with the current tunnel URL.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Repository in `owner/name` form.
    pub repo: String,
    pub token: String,
    /// Path of the JSON document inside the repository.
    pub config_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_tunnel_command")]
    pub command: String,
    /// Arguments passed to the tunnel binary; `{port}` is substituted.
    #[serde(default = "default_tunnel_args")]
    pub args: Vec<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            command: default_tunnel_command(),
            args: default_tunnel_args(),
            startup_timeout_secs: default_startup_timeout_secs(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertConfig {
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg_command(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

fn default_subtitle_extensions() -> Vec<String> {
    vec![".srt".to_string(), ".vtt".to_string()]
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_tunnel_command() -> String {
    "cloudflared".to_string()
}

fn default_tunnel_args() -> Vec<String> {
    vec![
        "tunnel".to_string(),
        "--url".to_string(),
        "http://localhost:{port}".to_string(),
    ]
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_initial_backoff_secs() -> u64 {
    1
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_ffmpeg_command() -> String {
    "ffmpeg".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

impl Config {
    /// Load configuration from the file named by `args`, applying CLI overrides.
    pub fn load(args: &Args) -> Result<Self> {
        let content = std::fs::read_to_string(&args.config)
            .with_context(|| format!("Failed to read config file: {}", args.config.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", args.config.display()))?;

        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(ref media_dir) = args.media_dir {
            config.media_dir = media_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.media_dir.is_dir() {
            anyhow::bail!(
                "Media path is not a valid directory: {}",
                self.media_dir.display()
            );
        }
        if self.supported_extensions.is_empty() {
            anyhow::bail!("supported_extensions must not be empty");
        }
        if self.playable_extensions.is_empty() {
            anyhow::bail!("playable_extensions must not be empty");
        }
        if self.rescan_interval_secs == 0 {
            anyhow::bail!("rescan_interval_secs must be greater than zero");
        }
        if self.publish.token.is_empty() {
            anyhow::bail!("publish.token must not be empty");
        }
        if !self.publish.repo.contains('/') {
            anyhow::bail!(
                "publish.repo must be in owner/name form, got: {}",
                self.publish.repo
            );
        }
        if self.publish.config_path.is_empty() {
            anyhow::bail!("publish.config_path must not be empty");
        }
        Ok(())
    }
}

/// Extension classification sets, resolved once at startup so the scanner and
/// conversion queue do hash lookups instead of repeated string comparisons.
#[derive(Debug, Clone)]
pub struct ExtensionSets {
    supported: HashSet<String>,
    playable: HashSet<String>,
    subtitles: HashSet<String>,
}

impl ExtensionSets {
    pub fn from_config(config: &Config) -> Self {
        Self {
            supported: normalize_set(&config.supported_extensions),
            playable: normalize_set(&config.playable_extensions),
            subtitles: normalize_set(&config.subtitle_extensions),
        }
    }

    pub fn is_supported(&self, ext: &str) -> bool {
        self.supported.contains(ext)
    }

    pub fn is_playable(&self, ext: &str) -> bool {
        self.playable.contains(ext)
    }

    pub fn is_subtitle(&self, ext: &str) -> bool {
        self.subtitles.contains(ext)
    }

    /// Supported but not browser-playable: these get queued for conversion.
    pub fn needs_conversion(&self, ext: &str) -> bool {
        self.supported.contains(ext) && !self.playable.contains(ext)
    }
}

fn normalize_set(extensions: &[String]) -> HashSet<String> {
    extensions
        .iter()
        .map(|ext| {
            let ext = ext.to_lowercase();
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{ext}")
            }
        })
        .collect()
}

/// Extract the lowercased extension (with leading dot) from a path.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

/// Baseline configuration for unit and integration tests.
#[cfg(test)]
pub(crate) fn test_config(media_dir: PathBuf) -> Config {
    Config {
        media_dir,
        port: 8080,
        supported_extensions: vec![
            ".mp4".into(),
            ".mkv".into(),
            ".avi".into(),
            ".mov".into(),
            ".webm".into(),
        ],
        playable_extensions: vec![".mp4".into(), ".webm".into()],
        rescan_interval_secs: 60,
        subtitle_extensions: default_subtitle_extensions(),
        publish: PublishConfig {
            api_base: default_api_base(),
            repo: "someone/stream-page".into(),
            token: "token".into(),
            config_path: "frontend/config.json".into(),
        },
        tunnel: TunnelConfig::default(),
        convert: ConvertConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_sets_classify() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let sets = ExtensionSets::from_config(&config);

        assert!(sets.is_supported(".mkv"));
        assert!(sets.is_playable(".mp4"));
        assert!(!sets.is_playable(".mkv"));
        assert!(sets.needs_conversion(".mkv"));
        assert!(!sets.needs_conversion(".mp4"));
        assert!(sets.is_subtitle(".srt"));
        assert!(!sets.is_supported(".txt"));
    }

    #[test]
    fn extensions_normalized_without_dot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.supported_extensions = vec!["MKV".into(), "mp4".into()];
        let sets = ExtensionSets::from_config(&config);
        assert!(sets.is_supported(".mkv"));
        assert!(sets.is_supported(".mp4"));
    }

    #[test]
    fn validate_rejects_missing_media_dir() {
        let config = test_config(PathBuf::from("/nonexistent/media"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_repo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.publish.repo = "no-slash".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let toml_src = format!(
            r#"
            media_dir = "{}"
            port = 8090
            supported_extensions = [".mp4", ".mkv"]
            playable_extensions = [".mp4"]
            rescan_interval_secs = 30

            [publish]
            repo = "someone/stream-page"
            token = "ghp_test"
            config_path = "frontend/config.json"
            "#,
            dir.path().display()
        );
        let config: Config = toml::from_str(&toml_src).unwrap();
        assert_eq!(config.port, 8090);
        assert_eq!(config.tunnel.command, "cloudflared");
        assert_eq!(config.convert.ffmpeg, "ffmpeg");
        assert_eq!(config.publish.api_base, "https://api.github.com");
        config.validate().unwrap();
    }

    #[test]
    fn missing_required_key_is_an_error() {
        // No publish section at all.
        let toml_src = r#"
            media_dir = "/tmp"
            port = 8090
            supported_extensions = [".mp4"]
            playable_extensions = [".mp4"]
            rescan_interval_secs = 30
        "#;
        assert!(toml::from_str::<Config>(toml_src).is_err());
    }

    #[test]
    fn extension_of_lowercases() {
        assert_eq!(
            extension_of(Path::new("dir/Movie.MKV")),
            Some(".mkv".to_string())
        );
        assert_eq!(extension_of(Path::new("noext")), None);
    }
}
