use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "fleet-evidence";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Local Ollama instance.
pub const DEFAULT_INFERENCE_URL: &str = "http://localhost:11434";
pub const DEFAULT_VISION_MODEL: &str = "llama3.2-vision:11b";

/// Per-call deadline when the caller does not pass one.
pub const DEFAULT_DEADLINE_SECS: u64 = 120;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Dev builds log more.
pub fn is_dev() -> bool {
    cfg!(debug_assertions)
}

/// `EnvFilter` directive used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if is_dev() {
        "info,fleet_evidence=debug"
    } else {
        "warn,fleet_evidence=info"
    }
}

/// Connection settings for the vision inference endpoint.
///
/// Built by the caller and handed to the gateway; the library never reads
/// process environment.
#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub model: String,
    /// Sent as a bearer token when set (hosted endpoints).
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    /// Ollama `keep_alive`; `None` leaves the server default.
    pub keep_alive: Option<String>,
    /// 0.0 keeps forensic judgments as repeatable as the model allows.
    pub temperature: f32,
    /// Refuse non-loopback endpoints.
    pub local_only: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_INFERENCE_URL.to_string(),
            model: DEFAULT_VISION_MODEL.to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keep_alive: None,
            temperature: 0.0,
            local_only: false,
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("temperature", &self.temperature)
            .field("local_only", &self.local_only)
            .finish()
    }
}

/// What `identify` does when the model cannot be reached or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifyFailureMode {
    /// Return the error to the caller.
    #[default]
    Propagate,
    /// Report "no identifier found" instead.
    SoftFail,
}

/// Per-pipeline behavior.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub deadline: Duration,
    pub identify_failure: IdentifyFailureMode,
    /// When set, each call writes its prompt, raw output, and result here.
    pub dump_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            identify_failure: IdentifyFailureMode::Propagate,
            dump_dir: None,
        }
    }
}

impl PipelineOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_identify_failure(mut self, mode: IdentifyFailureMode) -> Self {
        self.identify_failure = mode;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }
}
