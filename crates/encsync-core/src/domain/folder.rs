//! Folder records
//!
//! A folder binds a logical name to a prefix on one storage, together with
//! its encryption policy. Folders are built by the configuration layer and
//! are immutable for the lifetime of the process.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::path;

/// Maximum length of a storage name.
const STORAGE_NAME_MAX: usize = 64;

/// Validates a storage name against `^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,63}$`.
pub fn validate_storage_name(name: &str) -> Result<(), DomainError> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if first_ok && rest_ok && name.len() <= STORAGE_NAME_MAX {
        Ok(())
    } else {
        Err(DomainError::InvalidStorageName(name.to_string()))
    }
}

/// Where a storage keeps its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Remote,
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Local => f.write_str("local"),
            StorageKind::Remote => f.write_str("remote"),
        }
    }
}

/// Encoding of encrypted filename bytes into storage names
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilenameEncoding {
    /// URL-safe base64 with `=` padding
    #[default]
    Base64,
    /// Case-insensitive alphabet for case-folding storages
    Base41,
}

impl Display for FilenameEncoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FilenameEncoding::Base64 => f.write_str("base64"),
            FilenameEncoding::Base41 => f.write_str("base41"),
        }
    }
}

impl FromStr for FilenameEncoding {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base64" => Ok(FilenameEncoding::Base64),
            "base41" => Ok(FilenameEncoding::Base41),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown filename encoding: {other}"
            ))),
        }
    }
}

/// A logical root in some storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub storage_name: String,
    /// Absolute `/` path of the folder root inside the storage
    pub prefix: String,
    pub encrypted: bool,
    #[serde(default)]
    pub filename_encoding: FilenameEncoding,
    #[serde(default)]
    pub avoid_rescan: bool,
}

impl Folder {
    /// Creates a plaintext folder. The prefix is made absolute and normalized.
    pub fn new(name: impl Into<String>, storage_name: impl Into<String>, prefix: &str) -> Self {
        Self {
            name: name.into(),
            storage_name: storage_name.into(),
            prefix: normalize_prefix(prefix),
            encrypted: false,
            filename_encoding: FilenameEncoding::default(),
            avoid_rescan: false,
        }
    }

    /// Returns this folder with encryption enabled using `encoding`.
    pub fn encrypted(mut self, encoding: FilenameEncoding) -> Self {
        self.encrypted = true;
        self.filename_encoding = encoding;
        self
    }

    pub fn with_avoid_rescan(mut self, avoid_rescan: bool) -> Self {
        self.avoid_rescan = avoid_rescan;
        self
    }

    /// Absolute path of a folder-relative path.
    pub fn absolute(&self, relative: &str) -> String {
        if relative.is_empty() {
            return self.prefix.clone();
        }
        path::join(&self.prefix, relative.trim_start_matches(path::SEP))
    }

    /// Folder-relative path of an absolute path, if it lies under the prefix.
    pub fn relative(&self, absolute: &str) -> Result<String, DomainError> {
        path::cut_prefix(absolute, &self.prefix)
            .ok_or_else(|| DomainError::PathNotInFolder(absolute.to_string()))
    }
}

/// Prefixes are absolute and carry a trailing `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let absolute = if prefix.starts_with(path::SEP) {
        prefix.to_string()
    } else {
        format!("{}{prefix}", path::SEP)
    };
    path::normalize_dir(&path::join_properly("/", &absolute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_name_rules() {
        for ok in ["local", "_x", "my-drive.2", "A"] {
            assert!(validate_storage_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "-x", ".hidden", "a b", "a/b"] {
            assert!(validate_storage_name(bad).is_err(), "{bad}");
        }
        assert!(validate_storage_name(&"a".repeat(64)).is_ok());
        assert!(validate_storage_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn prefix_is_normalized() {
        assert_eq!(Folder::new("f", "s", "data/x").prefix, "/data/x/");
        assert_eq!(Folder::new("f", "s", "/").prefix, "/");
        assert_eq!(Folder::new("f", "s", "/a/./b/").prefix, "/a/b/");
    }

    #[test]
    fn absolute_and_relative_are_inverse() {
        let folder = Folder::new("f", "s", "/root");
        assert_eq!(folder.absolute(""), "/root/");
        assert_eq!(folder.absolute("a/b.txt"), "/root/a/b.txt");
        assert_eq!(folder.relative("/root/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(folder.relative("/root/").unwrap(), "");
        assert!(folder.relative("/other/x").is_err());
    }

    #[test]
    fn encoding_parses_case_insensitively() {
        assert_eq!(
            "BASE41".parse::<FilenameEncoding>().unwrap(),
            FilenameEncoding::Base41
        );
        assert!("hex".parse::<FilenameEncoding>().is_err());
    }
}
