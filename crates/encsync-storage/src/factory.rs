//! Storage factory
//!
//! The set of backends is closed: [`build_storage`] matches on the
//! configured kind. Remote backends are wrapped in a [`RetryingStorage`].

use std::sync::Arc;

use encsync_core::config::{Config, StorageConfig};
use encsync_core::domain::{validate_storage_name, StorageKind};
use encsync_core::ports::{Storage, StorageError};
use tracing::debug;

use crate::local::LocalStorage;
use crate::memory::MemoryStorage;
use crate::retry::{RetryPolicy, RetryingStorage};

/// Applies the retry policy of `config` to remote storages.
pub fn with_retries(storage: Arc<dyn Storage>, config: &Config) -> Arc<dyn Storage> {
    match storage.kind() {
        StorageKind::Local => storage,
        StorageKind::Remote => Arc::new(RetryingStorage::new(
            storage,
            RetryPolicy::from_config(config),
        )),
    }
}

/// Builds the storage called `name` from its configuration.
///
/// A `memory` storage starts empty every time it is built.
pub async fn build_storage(
    name: &str,
    storage_config: &StorageConfig,
    config: &Config,
) -> Result<Arc<dyn Storage>, StorageError> {
    validate_storage_name(name).map_err(|e| StorageError::Permanent(e.to_string()))?;
    debug!(storage = name, kind = storage_config.type_name(), "Building storage");

    let storage: Arc<dyn Storage> = match storage_config {
        StorageConfig::Local { root } => Arc::new(LocalStorage::new(name, root.clone())),
        StorageConfig::Memory { case_sensitive } => {
            Arc::new(MemoryStorage::with_case_sensitivity(name, *case_sensitive))
        }
        StorageConfig::Sftp {
            address,
            key_file,
            password,
        } => build_sftp(name, address, key_file.as_deref(), password.as_deref(), config).await?,
    };
    Ok(with_retries(storage, config))
}

#[cfg(feature = "sftp")]
async fn build_sftp(
    name: &str,
    address: &str,
    key_file: Option<&std::path::Path>,
    password: Option<&str>,
    config: &Config,
) -> Result<Arc<dyn Storage>, StorageError> {
    use crate::sftp::{SftpAddress, SftpAuth, SftpStorage};

    let address: SftpAddress = address.parse()?;
    let auth = match (key_file, password) {
        (Some(key), _) => SftpAuth::KeyFile(key.to_path_buf()),
        (None, Some(password)) => SftpAuth::Password(password.to_string()),
        (None, None) => SftpAuth::Agent,
    };
    let storage =
        SftpStorage::connect(name, address, auth, config.timeout.connect_duration()).await?;
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "sftp"))]
async fn build_sftp(
    name: &str,
    address: &str,
    _key_file: Option<&std::path::Path>,
    _password: Option<&str>,
    _config: &Config,
) -> Result<Arc<dyn Storage>, StorageError> {
    // Reject malformed addresses even when the backend is unavailable.
    address.parse::<crate::sftp::SftpAddress>()?;
    Err(StorageError::Permanent(format!(
        "storage {name}: SFTP support was not compiled in (enable the `sftp` feature)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_storage_is_not_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = build_storage(
            "disk",
            &StorageConfig::Local {
                root: dir.path().to_path_buf(),
            },
            &Config::default(),
        )
        .await
        .unwrap();
        assert_eq!(storage.kind(), StorageKind::Local);
        assert!(!storage.parallelizable());
        assert!(storage.is_dir("/").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_storage_keeps_case_sensitivity() {
        let storage = build_storage(
            "mem",
            &StorageConfig::Memory {
                case_sensitive: false,
            },
            &Config::default(),
        )
        .await
        .unwrap();
        assert_eq!(storage.name(), "mem");
        assert!(!storage.case_sensitive());
        assert!(storage.parallelizable());
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let result = build_storage(
            "-bad",
            &StorageConfig::Memory {
                case_sensitive: true,
            },
            &Config::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[cfg(not(feature = "sftp"))]
    #[tokio::test]
    async fn test_sftp_requires_feature() {
        let result = build_storage(
            "remote",
            &StorageConfig::Sftp {
                address: "user@host".to_string(),
                key_file: None,
                password: None,
            },
            &Config::default(),
        )
        .await;
        assert!(matches!(result, Err(StorageError::Permanent(_))));
    }
}
