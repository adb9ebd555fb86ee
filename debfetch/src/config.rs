//! Configuration for the acquire engine.
//!
//! `AcquireConfig` is what the engine consumes. `ConfigFile` reads the same
//! settings from an INI file:
//!
//! ```ini
//! [dirs]
//! lists = /var/lib/debfetch/lists
//! archives = /var/cache/debfetch/archives
//! methods = /usr/lib/apt/methods
//!
//! [acquire]
//! compression_order = gz xz bz2 lzma uncompressed
//! gzip_indexes = false
//! retries = 3
//! queue_mode = host
//!
//! [pdiffs]
//! enabled = true
//! merge = true
//! file_limit = 0
//! size_limit = 100
//!
//! [gpgv]
//! binary = gpgv
//! trusted = /etc/apt/trusted.gpg
//! trusted_parts = /etc/apt/trusted.gpg.d
//!
//! [mirror]
//! report_script = /usr/lib/apt/apt-report-mirror-failure
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::hashes::HashType;
use crate::message::string_to_bool;

/// Name of the pseudo-extension for an uncompressed index.
pub const UNCOMPRESSED: &str = "uncompressed";

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {reason}", path.display())]
    ReadFailed { path: PathBuf, reason: String },

    #[error("invalid value {value:?} for {section}.{key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("no configuration directory available")]
    NoConfigDir,
}

/// How queues are formed from URIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// One queue per `scheme:host`.
    #[default]
    Host,
    /// One queue per scheme.
    Access,
}

/// An external decompressor for one index extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressor {
    /// Transport scheme used for the decompression pass (`gzip:/path`).
    pub method: String,
    pub binary: String,
    pub args: Vec<String>,
}

impl Compressor {
    pub fn new(method: &str, binary: &str, args: &[&str]) -> Self {
        Self {
            method: method.to_string(),
            binary: binary.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Settings for the signature helper.
#[derive(Debug, Clone)]
pub struct GpgvConfig {
    pub binary: PathBuf,
    pub trusted: Option<PathBuf>,
    pub trusted_parts: Option<PathBuf>,
    pub options: Vec<String>,
}

impl Default for GpgvConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("gpgv"),
            trusted: Some(PathBuf::from("/etc/apt/trusted.gpg")),
            trusted_parts: Some(PathBuf::from("/etc/apt/trusted.gpg.d")),
            options: Vec::new(),
        }
    }
}

/// Configuration for the acquire engine.
#[derive(Debug, Clone)]
pub struct AcquireConfig {
    /// Where index files and release metadata are stored.
    pub lists_dir: PathBuf,

    /// Where package archives are stored.
    pub archives_dir: PathBuf,

    /// Directory holding external transport binaries.
    pub methods_dir: PathBuf,

    /// Index compression extensions, most preferred first.
    pub compression_order: Vec<String>,

    /// Decompressor per extension.
    pub compressors: BTreeMap<String, Compressor>,

    /// Keep `.gz` indexes compressed on disk.
    pub gzip_indexes: bool,

    pub pdiffs: bool,
    pub pdiffs_merge: bool,
    /// Maximum number of patches before falling back; 0 disables the check.
    pub pdiffs_file_limit: usize,
    /// Patch volume as a percentage of the full index size.
    pub pdiffs_size_limit: u64,

    /// Retry budget for transient failures.
    pub retries: u32,

    /// Hash family to use for archives instead of the strongest available.
    pub force_hash: Option<HashType>,

    pub allow_unauthenticated: bool,
    pub check_valid_until: bool,

    /// Symlink local archive sources instead of copying them.
    pub source_symlinks: bool,

    /// Accept archives without fetching them.
    pub archives_no_queue: bool,

    pub queue_mode: QueueMode,
    /// Per-scheme host queue limit before falling back to one shared queue.
    pub max_queues_per_scheme: usize,
    pub pipeline_depth: usize,

    /// A worker with outstanding requests and no traffic for this long is dropped.
    pub worker_timeout: Duration,
    /// Period of status pulses and timeout checks.
    pub pulse_interval: Duration,

    pub mirror_report_script: Option<PathBuf>,
    pub gpgv: GpgvConfig,
    pub auth_failure_hooks: Vec<String>,

    /// Request timeout for the built-in HTTP transport.
    pub http_timeout: Duration,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        let mut compressors = BTreeMap::new();
        compressors.insert("gz".to_string(), Compressor::new("gzip", "gzip", &["-d", "-c"]));
        compressors.insert("bz2".to_string(), Compressor::new("bzip2", "bzip2", &["-d", "-c"]));
        compressors.insert("xz".to_string(), Compressor::new("xz", "xz", &["-d", "-c"]));
        compressors.insert(
            "lzma".to_string(),
            Compressor::new("lzma", "xz", &["--format=lzma", "-d", "-c"]),
        );

        Self {
            lists_dir: PathBuf::from("/var/lib/debfetch/lists"),
            archives_dir: PathBuf::from("/var/cache/debfetch/archives"),
            methods_dir: PathBuf::from("/usr/lib/apt/methods"),
            compression_order: ["gz", "bz2", "xz", "lzma", UNCOMPRESSED]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            compressors,
            gzip_indexes: false,
            pdiffs: true,
            pdiffs_merge: true,
            pdiffs_file_limit: 0,
            pdiffs_size_limit: 100,
            retries: 0,
            force_hash: None,
            allow_unauthenticated: false,
            check_valid_until: true,
            source_symlinks: true,
            archives_no_queue: false,
            queue_mode: QueueMode::Host,
            max_queues_per_scheme: 10,
            pipeline_depth: 10,
            worker_timeout: Duration::from_secs(120),
            pulse_interval: Duration::from_millis(500),
            mirror_report_script: None,
            gpgv: GpgvConfig::default(),
            auth_failure_hooks: Vec::new(),
            http_timeout: Duration::from_secs(120),
        }
    }
}

impl AcquireConfig {
    /// Create a configuration rooted at a state and a cache directory.
    pub fn new(state_dir: impl AsRef<Path>, cache_dir: impl AsRef<Path>) -> Self {
        Self {
            lists_dir: state_dir.as_ref().join("lists"),
            archives_dir: cache_dir.as_ref().join("archives"),
            ..Default::default()
        }
    }

    pub fn with_lists_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lists_dir = dir.into();
        self
    }

    pub fn with_archives_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archives_dir = dir.into();
        self
    }

    pub fn with_methods_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.methods_dir = dir.into();
        self
    }

    pub fn with_compression_order<S: AsRef<str>>(mut self, order: &[S]) -> Self {
        self.compression_order = order.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_gzip_indexes(mut self, enabled: bool) -> Self {
        self.gzip_indexes = enabled;
        self
    }

    pub fn with_pdiffs(mut self, enabled: bool) -> Self {
        self.pdiffs = enabled;
        self
    }

    pub fn with_pdiffs_merge(mut self, enabled: bool) -> Self {
        self.pdiffs_merge = enabled;
        self
    }

    pub fn with_pdiffs_limits(mut self, file_limit: usize, size_limit_percent: u64) -> Self {
        self.pdiffs_file_limit = file_limit;
        self.pdiffs_size_limit = size_limit_percent;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_force_hash(mut self, kind: Option<HashType>) -> Self {
        self.force_hash = kind;
        self
    }

    pub fn with_allow_unauthenticated(mut self, allow: bool) -> Self {
        self.allow_unauthenticated = allow;
        self
    }

    pub fn with_check_valid_until(mut self, check: bool) -> Self {
        self.check_valid_until = check;
        self
    }

    pub fn with_source_symlinks(mut self, enabled: bool) -> Self {
        self.source_symlinks = enabled;
        self
    }

    pub fn with_archives_no_queue(mut self, enabled: bool) -> Self {
        self.archives_no_queue = enabled;
        self
    }

    pub fn with_queue_mode(mut self, mode: QueueMode) -> Self {
        self.queue_mode = mode;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub fn with_pulse_interval(mut self, interval: Duration) -> Self {
        self.pulse_interval = interval;
        self
    }

    pub fn with_mirror_report_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.mirror_report_script = Some(script.into());
        self
    }

    pub fn with_gpgv(mut self, gpgv: GpgvConfig) -> Self {
        self.gpgv = gpgv;
        self
    }

    pub fn with_auth_failure_hook(mut self, command: impl Into<String>) -> Self {
        self.auth_failure_hooks.push(command.into());
        self
    }

    /// `partial/` under the lists directory.
    pub fn lists_partial_dir(&self) -> PathBuf {
        self.lists_dir.join("partial")
    }

    /// `partial/` under the archives directory.
    pub fn archives_partial_dir(&self) -> PathBuf {
        self.archives_dir.join("partial")
    }

    /// Extensions in preference order, restricted to those with a decompressor.
    pub fn compression_types(&self) -> Vec<String> {
        self.compression_order
            .iter()
            .filter(|ext| ext.as_str() == UNCOMPRESSED || self.compressors.contains_key(*ext))
            .cloned()
            .collect()
    }

    /// Transport scheme that decompresses `ext`, `copy` for uncompressed.
    pub fn decompress_method(&self, ext: &str) -> Option<&str> {
        if ext == UNCOMPRESSED {
            return Some("copy");
        }
        self.compressors.get(ext).map(|c| c.method.as_str())
    }

    /// Decompressor registered under a transport scheme.
    pub fn compressor_for_method(&self, method: &str) -> Option<&Compressor> {
        self.compressors.values().find(|c| c.method == method)
    }
}

// ============================================================================
// INI file
// ============================================================================

/// Settings read from an INI file. Missing keys keep their defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    config: AcquireConfig,
}

impl ConfigFile {
    /// Default location: `<config dir>/debfetch/config.ini`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|d| d.join("debfetch").join("config.ini"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from the default location; a missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::ReadFailed {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = AcquireConfig::default();
        let get = |section: &str, key: &str| -> Option<String> {
            ini.section(Some(section))
                .and_then(|s| s.get(key))
                .map(|v| v.trim().to_string())
        };

        if let Some(v) = get("dirs", "lists") {
            config.lists_dir = PathBuf::from(v);
        }
        if let Some(v) = get("dirs", "archives") {
            config.archives_dir = PathBuf::from(v);
        }
        if let Some(v) = get("dirs", "methods") {
            config.methods_dir = PathBuf::from(v);
        }

        if let Some(v) = get("acquire", "compression_order") {
            config.compression_order = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = get("acquire", "gzip_indexes") {
            config.gzip_indexes = string_to_bool(&v, config.gzip_indexes);
        }
        if let Some(v) = get("acquire", "retries") {
            config.retries = parse_number("acquire", "retries", &v)?;
        }
        if let Some(v) = get("acquire", "force_hash") {
            config.force_hash = Some(HashType::from_name(&v).ok_or_else(|| invalid(
                "acquire",
                "force_hash",
                &v,
            ))?);
        }
        if let Some(v) = get("acquire", "allow_unauthenticated") {
            config.allow_unauthenticated = string_to_bool(&v, false);
        }
        if let Some(v) = get("acquire", "check_valid_until") {
            config.check_valid_until = string_to_bool(&v, true);
        }
        if let Some(v) = get("acquire", "source_symlinks") {
            config.source_symlinks = string_to_bool(&v, true);
        }
        if let Some(v) = get("acquire", "queue_mode") {
            config.queue_mode = match v.to_ascii_lowercase().as_str() {
                "host" => QueueMode::Host,
                "access" => QueueMode::Access,
                _ => return Err(invalid("acquire", "queue_mode", &v)),
            };
        }
        if let Some(v) = get("acquire", "pipeline_depth") {
            config.pipeline_depth = parse_number("acquire", "pipeline_depth", &v)?;
        }
        if let Some(v) = get("acquire", "worker_timeout") {
            config.worker_timeout =
                Duration::from_secs(parse_number("acquire", "worker_timeout", &v)?);
        }
        if let Some(v) = get("acquire", "auth_failure_hooks") {
            config.auth_failure_hooks = v
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(v) = get("pdiffs", "enabled") {
            config.pdiffs = string_to_bool(&v, true);
        }
        if let Some(v) = get("pdiffs", "merge") {
            config.pdiffs_merge = string_to_bool(&v, true);
        }
        if let Some(v) = get("pdiffs", "file_limit") {
            config.pdiffs_file_limit = parse_number("pdiffs", "file_limit", &v)?;
        }
        if let Some(v) = get("pdiffs", "size_limit") {
            config.pdiffs_size_limit = parse_number("pdiffs", "size_limit", &v)?;
        }

        if let Some(v) = get("gpgv", "binary") {
            config.gpgv.binary = PathBuf::from(v);
        }
        if let Some(v) = get("gpgv", "trusted") {
            config.gpgv.trusted = Some(PathBuf::from(v));
        }
        if let Some(v) = get("gpgv", "trusted_parts") {
            config.gpgv.trusted_parts = Some(PathBuf::from(v));
        }
        if let Some(v) = get("gpgv", "options") {
            config.gpgv.options = v.split_whitespace().map(str::to_string).collect();
        }

        if let Some(v) = get("mirror", "report_script") {
            config.mirror_report_script = Some(PathBuf::from(v));
        }

        Ok(Self { config })
    }

    pub fn acquire(&self) -> &AcquireConfig {
        &self.config
    }

    pub fn into_acquire_config(self) -> AcquireConfig {
        self.config
    }
}

fn invalid(section: &str, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(section, key, value))
}
