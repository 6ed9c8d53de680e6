//! Configuration module for encsync.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation, defaults, and a command-based builder for
//! programmatic use.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoError, Key};
use crate::domain::folder::{normalize_prefix, validate_storage_name, FilenameEncoding, Folder};
use crate::domain::path;
use crate::domain::target::{TargetFlags, TargetSpec};

/// Uploads at least this large get the extended read timeout (700 MiB).
pub const LARGE_UPLOAD_THRESHOLD: u64 = 700 * 1024 * 1024;

/// Minimum read timeout for large uploads.
pub const LARGE_UPLOAD_READ_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Duplicate {kind} name: {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("Unknown {kind}: {name}")]
    Unknown { kind: &'static str, name: String },

    #[error("Missing {0}")]
    MissingKey(&'static str),

    #[error("Invalid key: {0}")]
    Key(#[from] CryptoError),

    #[error("Invalid configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<ValidationError>),
}

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for encsync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the filelist, duplist and difflist databases.
    pub data_dir: PathBuf,
    /// Workers per synchronizer stage.
    pub sync_threads: u32,
    /// Concurrent directory listings per scan of a parallelizable storage.
    pub scan_threads: u32,
    /// Concurrent downloads.
    pub download_threads: u32,
    /// Default upload limit in bytes per second.
    pub upload_limit: Option<u64>,
    /// Default download limit in bytes per second.
    pub download_limit: Option<u64>,
    /// Attempts per remote call before giving up on a transient error.
    pub n_retries: u32,
    pub timeout: Timeout,
    pub upload_timeout: Timeout,
    /// `<storage>:<path>` entries; folders under them are encrypted.
    pub encrypted_dirs: BTreeSet<String>,
    /// Include/exclude rules, evaluated in declaration order.
    pub include_exclude: Vec<PatternRule>,
    /// URL-safe base64 key encrypting path segments.
    pub master_key: Option<String>,
    /// URL-safe base64 key encrypting file contents.
    pub data_key: Option<String>,
    pub storages: BTreeMap<String, StorageConfig>,
    pub folders: BTreeMap<String, FolderConfig>,
    pub targets: BTreeMap<String, TargetConfig>,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Connect/read timeouts of remote calls, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    pub connect: u64,
    pub read: u64,
}

impl Timeout {
    pub fn connect_duration(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn read_duration(&self) -> Duration {
        Duration::from_secs(self.read)
    }
}

/// Resolved timeouts for regular calls and for uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub default: Timeout,
    pub upload: Timeout,
}

impl Timeouts {
    /// Timeout for uploading `size` bytes.
    ///
    /// Uploads of 700 MiB or more get a read timeout of at least 300 s.
    pub fn for_upload(&self, size: u64) -> Timeout {
        let mut timeout = self.upload;
        if size >= LARGE_UPLOAD_THRESHOLD {
            timeout.read = timeout.read.max(LARGE_UPLOAD_READ_TIMEOUT.as_secs());
        }
        timeout
    }
}

/// Whether a rule includes or excludes its patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    #[serde(alias = "i")]
    Include,
    #[serde(alias = "e")]
    Exclude,
}

/// One include/exclude rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub kind: PatternKind,
    pub patterns: Vec<String>,
}

/// Storage backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem; storage paths are resolved under `root`.
    Local {
        #[serde(default = "default_local_root")]
        root: PathBuf,
    },
    /// In-process object store, mainly for tests and dry runs.
    Memory {
        #[serde(default = "default_true")]
        case_sensitive: bool,
    },
    /// SFTP host addressed as `user@host[:port]`.
    Sftp {
        address: String,
        #[serde(default)]
        key_file: Option<PathBuf>,
        #[serde(default)]
        password: Option<String>,
    },
}

impl StorageConfig {
    /// Kind name used in messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            StorageConfig::Local { .. } => "local",
            StorageConfig::Memory { .. } => "memory",
            StorageConfig::Sftp { .. } => "sftp",
        }
    }

    /// Whether the backend distinguishes names differing only by case.
    pub fn case_sensitive(&self) -> bool {
        match self {
            StorageConfig::Memory { case_sensitive } => *case_sensitive,
            StorageConfig::Local { .. } | StorageConfig::Sftp { .. } => true,
        }
    }
}

/// Folder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderConfig {
    pub storage: String,
    pub prefix: String,
    /// Forces encryption on or off; `None` defers to `encrypted_dirs`.
    #[serde(default)]
    pub encrypted: Option<bool>,
    /// Defaults to base41 on case-insensitive storages, base64 otherwise.
    #[serde(default)]
    pub filename_encoding: Option<FilenameEncoding>,
    #[serde(default)]
    pub avoid_rescan: bool,
}

/// Target settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub src: String,
    pub dst: String,
    #[serde(flatten)]
    pub flags: TargetFlags,
}

/// Centralized database writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Pending requests above which producers wait.
    pub queue_limit: usize,
    /// Seconds a producer may wait for the queue to drain.
    pub busy_timeout: u64,
    /// Seconds between seamless commits of long transactions.
    pub autocommit_interval: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_threads: 4,
            scan_threads: 8,
            download_threads: 2,
            upload_limit: None,
            download_limit: None,
            n_retries: 5,
            timeout: Timeout::default(),
            upload_timeout: Timeout {
                connect: 15,
                read: 60,
            },
            encrypted_dirs: BTreeSet::new(),
            include_exclude: Vec::new(),
            master_key: None,
            data_key: None,
            storages: BTreeMap::new(),
            folders: BTreeMap::new(),
            targets: BTreeMap::new(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self {
            connect: 15,
            read: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            queue_limit: 50,
            busy_timeout: 120,
            autocommit_interval: 450,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("encsync")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/encsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("encsync")
            .join("config.yaml")
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            default: self.timeout,
            upload: self.upload_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One configuration statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    DataDir(PathBuf),
    SyncThreads(u32),
    ScanThreads(u32),
    DownloadThreads(u32),
    UploadLimit(Option<u64>),
    DownloadLimit(Option<u64>),
    NRetries(u32),
    Timeout(Timeout),
    UploadTimeout(Timeout),
    EncryptedDir(String),
    Include(Vec<String>),
    Exclude(Vec<String>),
    MasterKey(String),
    DataKey(String),
    LogLevel(String),
    AddStorage { name: String, config: StorageConfig },
    AddFolder { name: String, config: FolderConfig },
    AddTarget { name: String, config: TargetConfig },
}

impl Config {
    /// Applies one command.
    pub fn apply(&mut self, command: Command) -> Result<(), ConfigError> {
        match command {
            Command::DataDir(dir) => self.data_dir = dir,
            Command::SyncThreads(n) => self.sync_threads = n,
            Command::ScanThreads(n) => self.scan_threads = n,
            Command::DownloadThreads(n) => self.download_threads = n,
            Command::UploadLimit(limit) => self.upload_limit = limit,
            Command::DownloadLimit(limit) => self.download_limit = limit,
            Command::NRetries(n) => self.n_retries = n,
            Command::Timeout(t) => self.timeout = t,
            Command::UploadTimeout(t) => self.upload_timeout = t,
            Command::EncryptedDir(dir) => {
                self.encrypted_dirs.insert(dir);
            }
            Command::Include(patterns) => self.include_exclude.push(PatternRule {
                kind: PatternKind::Include,
                patterns,
            }),
            Command::Exclude(patterns) => self.include_exclude.push(PatternRule {
                kind: PatternKind::Exclude,
                patterns,
            }),
            Command::MasterKey(key) => self.master_key = Some(key),
            Command::DataKey(key) => self.data_key = Some(key),
            Command::LogLevel(level) => self.logging.level = level,
            Command::AddStorage { name, config } => {
                insert_unique(&mut self.storages, "storage", name, config)?
            }
            Command::AddFolder { name, config } => {
                insert_unique(&mut self.folders, "folder", name, config)?
            }
            Command::AddTarget { name, config } => {
                insert_unique(&mut self.targets, "target", name, config)?
            }
        }
        Ok(())
    }

    /// Builds a configuration by applying `commands` to the defaults.
    pub fn from_commands<I>(commands: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Command>,
    {
        let mut config = Config::default();
        for command in commands {
            config.apply(command)?;
        }
        Ok(config)
    }
}

fn insert_unique<V>(
    map: &mut BTreeMap<String, V>,
    kind: &'static str,
    name: String,
    value: V,
) -> Result<(), ConfigError> {
    if map.contains_key(&name) {
        return Err(ConfigError::Duplicate { kind, name });
    }
    map.insert(name, value);
    Ok(())
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

impl Config {
    pub fn storage(&self, name: &str) -> Result<&StorageConfig, ConfigError> {
        self.storages.get(name).ok_or_else(|| ConfigError::Unknown {
            kind: "storage",
            name: name.to_string(),
        })
    }

    /// Whether `prefix` on `storage` lies under an `encrypted_dirs` entry.
    pub fn is_encrypted_dir(&self, storage: &str, prefix: &str) -> bool {
        let prefix = normalize_prefix(prefix);
        self.encrypted_dirs.iter().any(|entry| {
            entry
                .split_once(':')
                .map(|(s, dir)| s == storage && path::contains(&normalize_prefix(dir), &prefix))
                .unwrap_or(false)
        })
    }

    /// Resolves a folder record.
    pub fn folder(&self, name: &str) -> Result<Folder, ConfigError> {
        let fc = self.folders.get(name).ok_or_else(|| ConfigError::Unknown {
            kind: "folder",
            name: name.to_string(),
        })?;
        let storage = self.storage(&fc.storage)?;

        let encrypted = fc
            .encrypted
            .unwrap_or_else(|| self.is_encrypted_dir(&fc.storage, &fc.prefix));
        let encoding = fc.filename_encoding.unwrap_or(if storage.case_sensitive() {
            FilenameEncoding::Base64
        } else {
            FilenameEncoding::Base41
        });

        let mut folder =
            Folder::new(name, fc.storage.clone(), &fc.prefix).with_avoid_rescan(fc.avoid_rescan);
        if encrypted {
            folder = folder.encrypted(encoding);
        } else {
            folder.filename_encoding = encoding;
        }
        Ok(folder)
    }

    /// Resolves a target, filling speed limits from the global defaults.
    pub fn target(&self, name: &str) -> Result<TargetSpec, ConfigError> {
        let tc = self.targets.get(name).ok_or_else(|| ConfigError::Unknown {
            kind: "target",
            name: name.to_string(),
        })?;
        let mut flags = tc.flags.clone();
        flags.upload_limit = flags.upload_limit.or(self.upload_limit);
        flags.download_limit = flags.download_limit.or(self.download_limit);

        Ok(TargetSpec::new(name, self.folder(&tc.src)?, self.folder(&tc.dst)?).with_flags(flags))
    }

    /// Key encrypting path segments.
    pub fn master_key(&self) -> Result<Key, ConfigError> {
        let encoded = self
            .master_key
            .as_deref()
            .ok_or(ConfigError::MissingKey("master_key"))?;
        Ok(Key::from_base64(encoded)?)
    }

    /// Key encrypting file contents.
    pub fn data_key(&self) -> Result<Key, ConfigError> {
        let encoded = self
            .data_key
            .as_deref()
            .ok_or(ConfigError::MissingKey("data_key"))?;
        Ok(Key::from_base64(encoded)?)
    }

    /// Whether any configured folder is encrypted.
    pub fn uses_encryption(&self) -> bool {
        self.folders
            .keys()
            .any(|name| self.folder(name).map(|f| f.encrypted).unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"folders.photos.storage"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: String, message: String| {
            errors.push(ValidationError { field, message });
        };

        for (field, value) in [
            ("sync_threads", self.sync_threads),
            ("scan_threads", self.scan_threads),
            ("download_threads", self.download_threads),
        ] {
            if value == 0 {
                push(field.into(), "must be greater than 0".into());
            }
        }
        if self.database.queue_limit == 0 {
            push("database.queue_limit".into(), "must be greater than 0".into());
        }
        if self.timeout.read == 0 || self.upload_timeout.read == 0 {
            push("timeout.read".into(), "must be greater than 0".into());
        }

        for name in self.storages.keys() {
            if validate_storage_name(name).is_err() {
                push(
                    format!("storages.{name}"),
                    "name must match ^[A-Za-z0-9_][A-Za-z0-9_.-]{0,63}$".into(),
                );
            }
        }
        for (name, storage) in &self.storages {
            if let StorageConfig::Sftp { address, .. } = storage {
                if !address.contains('@') {
                    push(
                        format!("storages.{name}.address"),
                        format!("expected user@host[:port], got {address:?}"),
                    );
                }
            }
        }

        for (name, folder) in &self.folders {
            if validate_storage_name(name).is_err() {
                push(
                    format!("folders.{name}"),
                    "name must match ^[A-Za-z0-9_][A-Za-z0-9_.-]{0,63}$".into(),
                );
            }
            if !self.storages.contains_key(&folder.storage) {
                push(
                    format!("folders.{name}.storage"),
                    format!("unknown storage {:?}", folder.storage),
                );
            }
        }

        for (name, target) in &self.targets {
            for (side, folder) in [("src", &target.src), ("dst", &target.dst)] {
                if !self.folders.contains_key(folder) {
                    push(
                        format!("targets.{name}.{side}"),
                        format!("unknown folder {folder:?}"),
                    );
                }
            }
            if target.src == target.dst {
                push(
                    format!("targets.{name}"),
                    "source and destination must differ".into(),
                );
            }
        }

        for (field, key) in [("master_key", &self.master_key), ("data_key", &self.data_key)] {
            if let Some(encoded) = key {
                if let Err(e) = Key::from_base64(encoded) {
                    push(field.into(), e.to_string());
                }
            }
        }
        if self.uses_encryption() {
            for (field, key) in [("master_key", &self.master_key), ("data_key", &self.data_key)] {
                if key.is_none() {
                    push(field.into(), "required by encrypted folders".into());
                }
            }
        }

        for (i, rule) in self.include_exclude.iter().enumerate() {
            for pattern in &rule.patterns {
                if let Err(e) = glob::Pattern::new(pattern) {
                    push(format!("include_exclude[{i}]"), format!("{pattern:?}: {e}"));
                }
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level".into(),
                format!(
                    "must be one of {}, got {:?}",
                    VALID_LOG_LEVELS.join(", "),
                    self.logging.level
                ),
            );
        }

        errors
    }

    /// Validates and returns the configuration, or every error found.
    pub fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn key_b64() -> String {
        Key::new(vec![7u8; 32]).unwrap().to_base64()
    }

    fn sample() -> Config {
        Config::from_commands([
            Command::AddStorage {
                name: "local".into(),
                config: StorageConfig::Local {
                    root: PathBuf::from("/"),
                },
            },
            Command::AddStorage {
                name: "cloud".into(),
                config: StorageConfig::Memory {
                    case_sensitive: false,
                },
            },
            Command::AddFolder {
                name: "docs".into(),
                config: FolderConfig {
                    storage: "local".into(),
                    prefix: "/home/u/docs".into(),
                    encrypted: None,
                    filename_encoding: None,
                    avoid_rescan: false,
                },
            },
            Command::AddFolder {
                name: "backup".into(),
                config: FolderConfig {
                    storage: "cloud".into(),
                    prefix: "/backup/docs".into(),
                    encrypted: None,
                    filename_encoding: None,
                    avoid_rescan: true,
                },
            },
            Command::AddTarget {
                name: "docs-backup".into(),
                config: TargetConfig {
                    src: "docs".into(),
                    dst: "backup".into(),
                    flags: TargetFlags::default(),
                },
            },
            Command::EncryptedDir("cloud:/backup".into()),
            Command::MasterKey(key_b64()),
            Command::DataKey(key_b64()),
            Command::UploadLimit(Some(1_000_000)),
        ])
        .unwrap()
    }

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.n_retries, 5);
        assert_eq!(cfg.database.queue_limit, 50);
        assert_eq!(cfg.database.autocommit_interval, 450);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.data_dir.ends_with("encsync"));
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("encsync/config.yaml"));
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
data_dir: /tmp/encsync-test
sync_threads: 2
n_retries: 3
timeout:
  connect: 5
  read: 10
include_exclude:
  - kind: exclude
    patterns: ["*.tmp"]
  - kind: i
    patterns: ["/keep/*.tmp"]
storages:
  home:
    type: local
  box:
    type: memory
    case_sensitive: false
  host:
    type: sftp
    address: alice@example.org:2222
folders:
  photos:
    storage: home
    prefix: /photos
  vault:
    storage: box
    prefix: /vault
    encrypted: true
targets:
  photos-vault:
    src: photos
    dst: vault
    no_remove: true
    upload_limit: 2048
logging:
  level: debug
"#;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(yaml.as_bytes()).unwrap();

        let cfg = Config::load(tmp.path()).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/encsync-test"));
        assert_eq!(cfg.sync_threads, 2);
        assert_eq!(cfg.scan_threads, 8);
        assert_eq!(cfg.timeout.read, 10);
        assert_eq!(cfg.include_exclude[1].kind, PatternKind::Include);
        assert_eq!(
            cfg.storages["home"],
            StorageConfig::Local {
                root: PathBuf::from("/")
            }
        );
        assert_eq!(cfg.storages["host"].type_name(), "sftp");

        let target = cfg.target("photos-vault").unwrap();
        assert!(target.flags.no_remove);
        assert!(target.flags.enable_scan);
        assert_eq!(target.flags.upload_limit, Some(2048));
        assert!(target.dst.encrypted);
        assert_eq!(target.dst.filename_encoding, FilenameEncoding::Base41);
        assert_eq!(target.src.prefix, "/photos/");
    }

    #[test]
    fn load_or_default_falls_back() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/encsync.yaml"));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn yaml_round_trip() {
        let cfg = sample();
        let parsed: Config = serde_yaml::from_str(&cfg.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed, cfg);
    }

    // -- Commands and resolution --

    #[test]
    fn duplicate_names_are_rejected() {
        let mut cfg = sample();
        let err = cfg
            .apply(Command::AddStorage {
                name: "local".into(),
                config: StorageConfig::Memory {
                    case_sensitive: true,
                },
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { kind: "storage", .. }));
    }

    #[test]
    fn encrypted_dirs_mark_folders_encrypted() {
        let cfg = sample();
        assert!(cfg.is_encrypted_dir("cloud", "/backup/docs"));
        assert!(!cfg.is_encrypted_dir("cloud", "/other"));
        assert!(!cfg.is_encrypted_dir("local", "/backup"));

        let backup = cfg.folder("backup").unwrap();
        assert!(backup.encrypted);
        assert_eq!(backup.filename_encoding, FilenameEncoding::Base41);
        assert!(!cfg.folder("docs").unwrap().encrypted);
    }

    #[test]
    fn target_inherits_global_limits() {
        let target = sample().target("docs-backup").unwrap();
        assert_eq!(target.flags.upload_limit, Some(1_000_000));
        assert_eq!(target.flags.download_limit, None);
        assert!(target.avoid_dst_rescan());
        assert!(sample().target("missing").is_err());
    }

    #[test]
    fn keys_are_decoded() {
        let cfg = sample();
        assert_eq!(cfg.master_key().unwrap().len(), 32);
        assert!(matches!(
            Config::default().data_key(),
            Err(ConfigError::MissingKey("data_key"))
        ));
    }

    #[test]
    fn upload_timeout_is_extended_for_large_files() {
        let timeouts = Config::default().timeouts();
        assert_eq!(timeouts.for_upload(1024).read, 60);
        assert_eq!(timeouts.for_upload(LARGE_UPLOAD_THRESHOLD).read, 300);

        let generous = Timeouts {
            default: Timeout::default(),
            upload: Timeout {
                connect: 1,
                read: 900,
            },
        };
        assert_eq!(generous.for_upload(LARGE_UPLOAD_THRESHOLD).read, 900);
    }

    // -- Validation --

    #[test]
    fn sample_passes_validation() {
        assert!(sample().validate().is_empty(), "{:?}", sample().validate());
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut cfg = sample();
        cfg.sync_threads = 0;
        cfg.logging.level = "loud".into();
        cfg.data_key = None;
        cfg.storages.insert(
            "-bad".into(),
            StorageConfig::Memory {
                case_sensitive: true,
            },
        );
        cfg.folders.get_mut("docs").unwrap().storage = "nowhere".into();
        cfg.targets.get_mut("docs-backup").unwrap().dst = "ghost".into();
        cfg.include_exclude.push(PatternRule {
            kind: PatternKind::Exclude,
            patterns: vec!["[".into()],
        });

        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        for expected in [
            "sync_threads",
            "logging.level",
            "data_key",
            "storages.-bad",
            "folders.docs.storage",
            "targets.docs-backup.dst",
            "include_exclude[0]",
        ] {
            assert!(fields.iter().any(|f| f == expected), "missing {expected}: {fields:?}");
        }
        assert!(matches!(cfg.validated(), Err(ConfigError::Invalid(_))));
    }
}
