//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Encoding engine binaries and invocation limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FfmpegConfig {
    /// ffmpeg executable (name on PATH or absolute path)
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    /// ffprobe executable (name on PATH or absolute path)
    #[serde(default = "default_ffprobe_binary")]
    pub ffprobe_binary: String,
    /// Threads handed to the encoder
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Upper bound for a single engine invocation, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_binary() -> String {
    "ffprobe".to_string()
}

fn default_threads() -> u32 {
    12
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: default_ffmpeg_binary(),
            ffprobe_binary: default_ffprobe_binary(),
            threads: default_threads(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding uploaded source assets
    #[serde(default = "default_uploaded_dir")]
    pub uploaded_dir: PathBuf,
    /// Directory receiving encoded artifacts
    #[serde(default = "default_converted_dir")]
    pub converted_dir: PathBuf,
    /// Directory holding JSON job, profile, user and download records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_uploaded_dir() -> PathBuf {
    PathBuf::from("storage/uploaded")
}

fn default_converted_dir() -> PathBuf {
    PathBuf::from("storage/converted")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("storage/state")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploaded_dir: default_uploaded_dir(),
            converted_dir: default_converted_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// Owning-service callback settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackConfig {
    /// Path appended to the owning user's base URL
    #[serde(default = "default_callback_path")]
    pub path: String,
    /// Request timeout in seconds
    #[serde(default = "default_callback_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_callback_path() -> String {
    "/transcoderwebservice/callback".to_string()
}

fn default_callback_timeout_secs() -> u64 {
    30
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            path: default_callback_path(),
            timeout_secs: default_callback_timeout_secs(),
        }
    }
}

/// Artifact file server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address the file server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL used when building artifact links
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_public_url() -> String {
    "http://127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
        }
    }
}

/// Worker invocation policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Attempt number at which a failure is reported as final
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    2
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FFMPEG_BINARY -> ffmpeg.ffmpeg_binary
    /// - FFPROBE_BINARY -> ffmpeg.ffprobe_binary
    /// - FFMPEG_THREADS -> ffmpeg.threads
    /// - FFMPEG_TIMEOUT -> ffmpeg.timeout_secs
    /// - TRANSCODER_UPLOADED_DIR -> storage.uploaded_dir
    /// - TRANSCODER_CONVERTED_DIR -> storage.converted_dir
    /// - TRANSCODER_STATE_DIR -> storage.state_dir
    /// - TRANSCODER_CALLBACK_PATH -> callback.path
    /// - TRANSCODER_CALLBACK_TIMEOUT -> callback.timeout_secs
    /// - TRANSCODER_BIND -> server.bind
    /// - TRANSCODER_PUBLIC_URL -> server.public_url
    /// - TRANSCODER_MAX_ATTEMPTS -> worker.max_attempts
    ///
    /// Unparseable numeric values leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FFMPEG_BINARY") {
            self.ffmpeg.ffmpeg_binary = val;
        }

        if let Ok(val) = env::var("FFPROBE_BINARY") {
            self.ffmpeg.ffprobe_binary = val;
        }

        if let Ok(val) = env::var("FFMPEG_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.ffmpeg.threads = threads;
            }
        }

        if let Ok(val) = env::var("FFMPEG_TIMEOUT") {
            if let Ok(secs) = val.parse::<u64>() {
                self.ffmpeg.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("TRANSCODER_UPLOADED_DIR") {
            self.storage.uploaded_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("TRANSCODER_CONVERTED_DIR") {
            self.storage.converted_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("TRANSCODER_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("TRANSCODER_CALLBACK_PATH") {
            self.callback.path = val;
        }

        if let Ok(val) = env::var("TRANSCODER_CALLBACK_TIMEOUT") {
            if let Ok(secs) = val.parse::<u64>() {
                self.callback.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("TRANSCODER_BIND") {
            self.server.bind = val;
        }

        if let Ok(val) = env::var("TRANSCODER_PUBLIC_URL") {
            self.server.public_url = val;
        }

        if let Ok(val) = env::var("TRANSCODER_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.worker.max_attempts = attempts;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    /// (still subject to environment overrides).
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load_from_file(path) {
            Ok(mut config) => {
                config.apply_env_overrides();
                Ok(config)
            }
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "FFMPEG_BINARY",
        "FFPROBE_BINARY",
        "FFMPEG_THREADS",
        "FFMPEG_TIMEOUT",
        "TRANSCODER_UPLOADED_DIR",
        "TRANSCODER_CONVERTED_DIR",
        "TRANSCODER_STATE_DIR",
        "TRANSCODER_CALLBACK_PATH",
        "TRANSCODER_CALLBACK_TIMEOUT",
        "TRANSCODER_BIND",
        "TRANSCODER_PUBLIC_URL",
        "TRANSCODER_MAX_ATTEMPTS",
    ];

    fn clear_env_vars() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    // Property: every section of a well-formed TOML document is parsed,
    // and environment variables override the parsed values.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            threads in 1u32..64,
            timeout in 1u64..100_000,
            converted in "[a-z/]{1,30}",
            callback_timeout in 1u64..600,
            max_attempts in 1u32..10,
        ) {
            let toml_str = format!(
                r#"
[ffmpeg]
ffmpeg_binary = "/usr/bin/ffmpeg"
threads = {}
timeout_secs = {}

[storage]
converted_dir = "{}"

[callback]
timeout_secs = {}

[server]
public_url = "https://transcoder.example"

[worker]
max_attempts = {}
"#,
                threads, timeout, converted, callback_timeout, max_attempts
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.ffmpeg.ffmpeg_binary.as_str(), "/usr/bin/ffmpeg");
            prop_assert_eq!(config.ffmpeg.ffprobe_binary.as_str(), "ffprobe");
            prop_assert_eq!(config.ffmpeg.threads, threads);
            prop_assert_eq!(config.ffmpeg.timeout_secs, timeout);
            prop_assert_eq!(config.storage.converted_dir, PathBuf::from(&converted));
            prop_assert_eq!(config.callback.timeout_secs, callback_timeout);
            prop_assert_eq!(config.server.public_url.as_str(), "https://transcoder.example");
            prop_assert_eq!(config.worker.max_attempts, max_attempts);
        }

        #[test]
        fn prop_env_overrides_threads(
            initial in 1u32..32,
            override_threads in 1u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[ffmpeg]\nthreads = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("FFMPEG_THREADS", override_threads.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.ffmpeg.threads, override_threads);
        }

        #[test]
        fn prop_env_overrides_max_attempts(
            initial in 1u32..5,
            override_attempts in 1u32..10,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\nmax_attempts = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TRANSCODER_MAX_ATTEMPTS", override_attempts.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.max_attempts, override_attempts);
        }

        #[test]
        fn prop_env_overrides_storage_dirs(
            state in "[a-z]{1,12}",
            uploaded in "[a-z]{1,12}",
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("TRANSCODER_STATE_DIR", &state);
            env::set_var("TRANSCODER_UPLOADED_DIR", &uploaded);
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.storage.state_dir, PathBuf::from(&state));
            prop_assert_eq!(config.storage.uploaded_dir, PathBuf::from(&uploaded));
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.ffmpeg.ffmpeg_binary, "ffmpeg");
        assert_eq!(config.ffmpeg.ffprobe_binary, "ffprobe");
        assert_eq!(config.ffmpeg.threads, 12);
        assert_eq!(config.ffmpeg.timeout_secs, 3600);
        assert_eq!(config.storage.converted_dir, PathBuf::from("storage/converted"));
        assert_eq!(config.callback.path, "/transcoderwebservice/callback");
        assert_eq!(config.server.bind, "127.0.0.1:7878");
        assert_eq!(config.worker.max_attempts, 2);
    }

    #[test]
    fn test_invalid_numeric_override_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("FFMPEG_TIMEOUT", "forever");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.ffmpeg.timeout_secs, 3600);
    }

    #[test]
    fn test_load_or_default_with_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/transcoder/config.toml")
            .expect("Missing file should fall back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let err = Config::parse_toml("[ffmpeg\nthreads = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
