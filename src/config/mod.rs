//! Configuration for the memodesk service
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/memodesk/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP surface binds to
    pub bind_addr: SocketAddr,

    /// Root for uploads and other service-owned files
    pub data_dir: PathBuf,

    /// SQLite database file
    pub db_path: PathBuf,

    /// Speech-to-text settings
    pub whisper: WhisperConfig,

    /// LLM server settings
    pub llm: LlmConfig,

    /// Worker runner settings
    pub worker: WorkerConfig,

    /// Transcript retention settings
    pub ttl: TtlConfig,

    /// Push notification identity (absent = deliveries are no-ops)
    pub vapid: Option<VapidConfig>,

    /// Log filter level when RUST_LOG is unset
    pub log_level: String,

    /// Optional rotating log file (daily), in addition to stdout
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Explicit CLI path; otherwise the PATH is searched
    pub cli_path: Option<String>,
    pub models_dir: PathBuf,
    /// tiny | base | small
    pub model: String,
    pub threads: u32,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub server_bin: String,
    pub models_dir: PathBuf,
    pub model_file: String,
    pub port: u16,
    pub context_size: u32,
    pub threads: u32,
    pub batch_size: u32,
    pub gpu_layers: u32,
    /// Spawn and manage the server at start-up; otherwise the admin API
    /// starts it on demand
    pub autostart: bool,
}

impl LlmConfig {
    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join(&self.model_file)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    pub shutdown_deadline_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TtlConfig {
    pub transcript_ttl_days: i64,
    pub cleanup_interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

impl Config {
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memodesk");
        Self {
            bind_addr: "127.0.0.1:8787".parse().expect("static addr"),
            db_path: data_dir.join("memodesk.db"),
            whisper: WhisperConfig {
                cli_path: None,
                models_dir: data_dir.join("whisper-models"),
                model: "base".to_string(),
                threads: 4,
            },
            llm: LlmConfig {
                server_bin: "llama-server".to_string(),
                models_dir: data_dir.join("llm-models"),
                model_file: "model.gguf".to_string(),
                port: 8089,
                context_size: 8192,
                threads: 4,
                batch_size: 512,
                gpu_layers: 0,
                autostart: true,
            },
            worker: WorkerConfig {
                poll_interval_ms: 3000,
                max_concurrent: 2,
                shutdown_deadline_secs: 30,
            },
            ttl: TtlConfig {
                transcript_ttl_days: 14,
                cleanup_interval_hours: 24,
            },
            vapid: None,
            log_level: "info".to_string(),
            log_file: None,
            data_dir,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    bind_addr: Option<String>,
    data_dir: Option<String>,
    db_path: Option<String>,
    log_level: Option<String>,
    whisper_model: Option<String>,
    whisper_threads: Option<u32>,
    transcript_ttl_days: Option<i64>,
    worker_poll_interval_ms: Option<u64>,
    worker_max_concurrent: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

impl Config {
    /// Config file path: ~/.config/memodesk/config.toml
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("memodesk").join("config.toml"))
    }

    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    // A broken config should fail fast with a clear error,
                    // not silently fall back to defaults.
                    eprintln!("Failed to parse {}: {}", path.display(), e);
                    eprintln!("Fix or delete the file and restart memodesk.");
                    std::process::exit(1);
                }
            },
            Err(_) => FileConfig::default(),
        }
    }

    /// Load configuration: env vars > file > defaults.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Config::default();

        let data_dir = env_string("DATA_DIR")
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let db_path = env_string("DB_PATH")
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("memodesk.db"));

        let bind_addr = env_string("BIND_ADDR")
            .or(file.bind_addr)
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_addr);

        let whisper = WhisperConfig {
            cli_path: env_string("WHISPER_CLI_PATH"),
            models_dir: env_string("WHISPER_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("whisper-models")),
            model: env_string("WHISPER_MODEL")
                .or(file.whisper_model)
                .unwrap_or(defaults.whisper.model),
            threads: env_parse("WHISPER_THREADS")
                .or(file.whisper_threads)
                .unwrap_or(defaults.whisper.threads),
        };

        let llm = LlmConfig {
            server_bin: env_string("LLM_SERVER_BIN").unwrap_or(defaults.llm.server_bin),
            models_dir: env_string("LLM_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("llm-models")),
            model_file: env_string("LLM_MODEL").unwrap_or(defaults.llm.model_file),
            port: env_parse("LLM_PORT").unwrap_or(defaults.llm.port),
            context_size: env_parse("LLM_CONTEXT_SIZE").unwrap_or(defaults.llm.context_size),
            threads: env_parse("LLM_THREADS").unwrap_or(defaults.llm.threads),
            batch_size: env_parse("LLM_BATCH_SIZE").unwrap_or(defaults.llm.batch_size),
            gpu_layers: env_parse("LLM_GPU_LAYERS").unwrap_or(defaults.llm.gpu_layers),
            autostart: env_string("LLM_AUTOSTART")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.llm.autostart),
        };

        let worker = WorkerConfig {
            poll_interval_ms: env_parse("WORKER_POLL_INTERVAL_MS")
                .or(file.worker_poll_interval_ms)
                .unwrap_or(defaults.worker.poll_interval_ms),
            max_concurrent: env_parse("WORKER_MAX_CONCURRENT")
                .or(file.worker_max_concurrent)
                .unwrap_or(defaults.worker.max_concurrent),
            shutdown_deadline_secs: env_parse("WORKER_SHUTDOWN_DEADLINE_SECS")
                .unwrap_or(defaults.worker.shutdown_deadline_secs),
        };

        let ttl = TtlConfig {
            transcript_ttl_days: env_parse("TRANSCRIPT_TTL_DAYS")
                .or(file.transcript_ttl_days)
                .unwrap_or(defaults.ttl.transcript_ttl_days),
            cleanup_interval_hours: env_parse("CLEANUP_INTERVAL_HOURS")
                .unwrap_or(defaults.ttl.cleanup_interval_hours),
        };

        // Push is enabled only when the full identity is present.
        let vapid = match (
            env_string("VAPID_PUBLIC_KEY"),
            env_string("VAPID_PRIVATE_KEY"),
            env_string("VAPID_SUBJECT"),
        ) {
            (Some(public_key), Some(private_key), Some(subject)) => Some(VapidConfig {
                public_key,
                private_key,
                subject,
            }),
            _ => None,
        };

        let log_level = env_string("MEMODESK_LOG")
            .or(file.log_level)
            .unwrap_or(defaults.log_level);
        let log_file = env_string("MEMODESK_LOG_FILE").map(PathBuf::from);

        Self {
            bind_addr,
            data_dir,
            db_path,
            whisper,
            llm,
            worker,
            ttl,
            vapid,
            log_level,
            log_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker.max_concurrent, 2);
        assert_eq!(config.worker.poll_interval_ms, 3000);
        assert_eq!(config.ttl.transcript_ttl_days, 14);
        assert_eq!(config.ttl.cleanup_interval_hours, 24);
        assert_eq!(config.whisper.model, "base");
        assert!(config.vapid.is_none());
    }

    #[test]
    fn uploads_dir_hangs_off_data_dir() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/srv/memodesk");
        assert_eq!(config.uploads_dir(), PathBuf::from("/srv/memodesk/uploads"));
    }

    #[test]
    fn file_config_parses_partial_toml() {
        let file: FileConfig =
            toml::from_str("whisper_model = \"tiny\"\ntranscript_ttl_days = 7\n").unwrap();
        assert_eq!(file.whisper_model.as_deref(), Some("tiny"));
        assert_eq!(file.transcript_ttl_days, Some(7));
        assert!(file.bind_addr.is_none());
    }
}
