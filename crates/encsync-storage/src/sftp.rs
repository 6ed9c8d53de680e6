//! SFTP storage
//!
//! Addresses look like `user@host[:port][/root]`. The root defaults to `/`
//! and every storage path is resolved below it.
//!
//! The adapter itself is compiled with the `sftp` feature. It drives a
//! blocking `ssh2` session from `spawn_blocking`, so calls on one storage
//! are serialized by a mutex around the session.

use std::fmt;
use std::str::FromStr;

use encsync_core::domain::path;
use encsync_core::ports::StorageError;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Parsed `user@host[:port][/root]` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpAddress {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub root: String,
}

impl SftpAddress {
    /// Remote path of a storage path.
    pub fn resolve(&self, storage_path: &str) -> String {
        let relative = path::join_properly("/", storage_path);
        path::join_properly(&self.root, relative.trim_start_matches(path::SEP))
    }

    /// `host:port`, as given to the TCP connect.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SftpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}{}", self.user, self.host, self.port, self.root)
    }
}

impl FromStr for SftpAddress {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| StorageError::Permanent(format!("invalid SFTP address {s:?}: {reason}"));

        let (authority, root) = match s.find(path::SEP) {
            Some(idx) => (&s[..idx], &s[idx..]),
            None => (s, "/"),
        };
        let (user, host_port) = authority
            .split_once('@')
            .ok_or_else(|| invalid("missing user"))?;
        if user.is_empty() {
            return Err(invalid("empty user"));
        }

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, port)
            }
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            root: path::join_properly("/", root),
        })
    }
}

#[cfg(feature = "sftp")]
pub use adapter::{SftpAuth, SftpStorage};

#[cfg(feature = "sftp")]
mod adapter {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use encsync_core::domain::{path, StorageKind};
    use encsync_core::ports::{
        BoxedReader, ChunkSink, Meta, Storage, StorageError, TransferController,
    };
    use ssh2::{ErrorCode, FileStat, RenameFlags, Session, Sftp};
    use tokio::io::AsyncWriteExt;
    use tracing::{debug, info, instrument};

    use super::SftpAddress;

    const FX_NO_SUCH_FILE: i32 = 2;
    const FX_FILE_ALREADY_EXISTS: i32 = 11;

    /// How to authenticate against the host
    #[derive(Debug, Clone)]
    pub enum SftpAuth {
        KeyFile(PathBuf),
        Password(String),
        Agent,
    }

    fn map_error(err: ssh2::Error, path: &str) -> StorageError {
        match err.code() {
            ErrorCode::SFTP(FX_NO_SUCH_FILE) => StorageError::NotFound(path.to_string()),
            ErrorCode::SFTP(FX_FILE_ALREADY_EXISTS) => StorageError::AlreadyExists(path.to_string()),
            ErrorCode::SFTP(_) => StorageError::Permanent(format!("{path}: {err}")),
            ErrorCode::Session(_) => StorageError::Temporary(format!("{path}: {err}")),
        }
    }

    fn meta_of(name: String, stat: &FileStat) -> Meta {
        let modified = stat
            .mtime
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let file_type = stat.file_type();
        if file_type.is_dir() {
            Meta::dir(name, modified)
        } else if file_type.is_file() {
            Meta::file(name, modified, stat.size.unwrap_or(0))
        } else {
            Meta::missing(name)
        }
    }

    /// Storage on an SFTP host
    pub struct SftpStorage {
        name: String,
        address: SftpAddress,
        // Keeps the session alive for the SFTP channel.
        _session: Session,
        sftp: Arc<Mutex<Sftp>>,
    }

    impl std::fmt::Debug for SftpStorage {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SftpStorage")
                .field("name", &self.name)
                .field("address", &self.address)
                .finish()
        }
    }

    impl SftpStorage {
        /// Opens the SSH session and the SFTP channel.
        pub async fn connect(
            name: impl Into<String>,
            address: SftpAddress,
            auth: SftpAuth,
            connect_timeout: Duration,
        ) -> Result<Self, StorageError> {
            let name = name.into();
            let target = address.clone();
            let (session, sftp) = tokio::task::spawn_blocking(move || {
                let shown = target.to_string();
                let tcp = TcpStream::connect(target.socket_address())
                    .map_err(|e| StorageError::from_io(e, &shown))?;
                let mut session = Session::new().map_err(|e| map_error(e, &shown))?;
                session.set_timeout(connect_timeout.as_millis() as u32);
                session.set_tcp_stream(tcp);
                session.handshake().map_err(|e| map_error(e, &shown))?;

                let authenticated = match &auth {
                    SftpAuth::KeyFile(key) => {
                        session.userauth_pubkey_file(&target.user, None, key, None)
                    }
                    SftpAuth::Password(password) => {
                        session.userauth_password(&target.user, password)
                    }
                    SftpAuth::Agent => session.userauth_agent(&target.user),
                };
                authenticated.map_err(|e| StorageError::Auth(format!("{shown}: {e}")))?;
                // Per-call deadlines are enforced by the retry wrapper.
                session.set_timeout(0);

                let sftp = session.sftp().map_err(|e| map_error(e, &shown))?;
                Ok::<_, StorageError>((session, sftp))
            })
            .await
            .map_err(|e| StorageError::Permanent(format!("SFTP connect task failed: {e}")))??;

            info!(storage = %name, address = %address, "SFTP session established");
            Ok(Self {
                name,
                address,
                _session: session,
                sftp: Arc::new(Mutex::new(sftp)),
            })
        }

        /// Runs `op` on the blocking pool with the SFTP channel.
        async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
        where
            T: Send + 'static,
            F: FnOnce(&Sftp) -> Result<T, StorageError> + Send + 'static,
        {
            let sftp = Arc::clone(&self.sftp);
            tokio::task::spawn_blocking(move || {
                let guard = sftp
                    .lock()
                    .map_err(|_| StorageError::Permanent("SFTP channel poisoned".to_string()))?;
                op(&guard)
            })
            .await
            .map_err(|e| StorageError::Permanent(format!("SFTP task failed: {e}")))?
        }
    }

    fn remove_recursive(sftp: &Sftp, remote: &Path, shown: &str) -> Result<(), StorageError> {
        let stat = sftp.lstat(remote).map_err(|e| map_error(e, shown))?;
        if stat.file_type().is_dir() {
            for (child, _) in sftp.readdir(remote).map_err(|e| map_error(e, shown))? {
                remove_recursive(sftp, &child, shown)?;
            }
            sftp.rmdir(remote).map_err(|e| map_error(e, shown))
        } else {
            sftp.unlink(remote).map_err(|e| map_error(e, shown))
        }
    }

    #[async_trait]
    impl Storage for SftpStorage {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> StorageKind {
            StorageKind::Remote
        }

        fn case_sensitive(&self) -> bool {
            true
        }

        fn parallelizable(&self) -> bool {
            true
        }

        #[instrument(skip(self), fields(storage = %self.name))]
        async fn get_meta(&self, storage_path: &str) -> Result<Meta, StorageError> {
            let remote = self.address.resolve(storage_path);
            let name = path::basename(storage_path).to_string();
            self.blocking(move |sftp| match sftp.lstat(Path::new(&remote)) {
                Ok(stat) => Ok(meta_of(name, &stat)),
                Err(e) => match map_error(e, &remote) {
                    StorageError::NotFound(_) => Ok(Meta::missing(name)),
                    other => Err(other),
                },
            })
            .await
        }

        #[instrument(skip(self), fields(storage = %self.name))]
        async fn listdir(&self, storage_path: &str) -> Result<Vec<Meta>, StorageError> {
            let remote = self.address.resolve(storage_path);
            self.blocking(move |sftp| {
                let entries = sftp
                    .readdir(Path::new(&remote))
                    .map_err(|e| map_error(e, &remote))?;
                Ok(entries
                    .into_iter()
                    .filter_map(|(child, stat)| {
                        let name = child.file_name()?.to_string_lossy().into_owned();
                        let meta = meta_of(name, &stat);
                        meta.exists().then_some(meta)
                    })
                    .collect())
            })
            .await
        }

        #[instrument(skip(self), fields(storage = %self.name))]
        async fn mkdir(&self, storage_path: &str) -> Result<(), StorageError> {
            let remote = self.address.resolve(storage_path);
            self.blocking(move |sftp| {
                let target = Path::new(&remote);
                match sftp.mkdir(target, 0o755) {
                    Ok(()) => Ok(()),
                    // Many servers answer a plain failure for existing entries.
                    Err(e) => match sftp.lstat(target) {
                        Ok(_) => Err(StorageError::AlreadyExists(remote.clone())),
                        Err(_) => Err(map_error(e, &remote)),
                    },
                }
            })
            .await
        }

        #[instrument(skip(self), fields(storage = %self.name))]
        async fn remove(&self, storage_path: &str) -> Result<(), StorageError> {
            let remote = self.address.resolve(storage_path);
            self.blocking(move |sftp| remove_recursive(sftp, Path::new(&remote), &remote))
                .await?;
            debug!(path = storage_path, "Removed");
            Ok(())
        }

        #[instrument(skip(self, reader), fields(storage = %self.name))]
        async fn upload(
            &self,
            reader: BoxedReader,
            size: u64,
            storage_path: &str,
        ) -> Result<TransferController, StorageError> {
            let remote = self.address.resolve(storage_path);
            let tmp = format!("{remote}.tmp");
            let open_tmp = tmp.clone();
            let file = self
                .blocking(move |sftp| {
                    sftp.create(Path::new(&open_tmp))
                        .map_err(|e| map_error(e, &open_tmp))
                })
                .await?;
            let sink = SftpSink {
                sftp: Arc::clone(&self.sftp),
                file: Some(Arc::new(Mutex::new(file))),
                tmp,
                target: remote,
            };
            Ok(TransferController::new(reader, Box::new(sink), self.chunk_size()).with_size(size))
        }

        #[instrument(skip(self, sink), fields(storage = %self.name))]
        async fn download(
            &self,
            storage_path: &str,
            sink: Box<dyn ChunkSink>,
        ) -> Result<TransferController, StorageError> {
            let remote = self.address.resolve(storage_path);
            let open_path = remote.clone();
            let (file, size) = self
                .blocking(move |sftp| {
                    let mut file = sftp
                        .open(Path::new(&open_path))
                        .map_err(|e| map_error(e, &open_path))?;
                    let size = file
                        .stat()
                        .map_err(|e| map_error(e, &open_path))?
                        .size
                        .unwrap_or(0);
                    Ok((file, size))
                })
                .await?;

            let chunk_size = self.chunk_size();
            let (reader, mut writer) = tokio::io::duplex(chunk_size);
            let file = Arc::new(Mutex::new(file));
            tokio::spawn(async move {
                loop {
                    let file = Arc::clone(&file);
                    let read = tokio::task::spawn_blocking(move || {
                        let mut buf = vec![0u8; chunk_size];
                        let mut guard = file
                            .lock()
                            .map_err(|_| std::io::Error::other("SFTP file poisoned"))?;
                        let n = guard.read(&mut buf)?;
                        buf.truncate(n);
                        Ok::<_, std::io::Error>(buf)
                    })
                    .await;
                    match read {
                        Ok(Ok(buf)) if !buf.is_empty() => {
                            if writer.write_all(&buf).await.is_err() {
                                break;
                            }
                        }
                        Ok(Ok(_)) => break,
                        Ok(Err(e)) => {
                            debug!(path = %remote, error = %e, "SFTP read failed");
                            break;
                        }
                        Err(_) => break,
                    }
                }
            });

            Ok(TransferController::new(Box::new(reader), sink, chunk_size).with_size(size))
        }
    }

    /// Writes an upload to `<target>.tmp` and renames it on `finish`
    struct SftpSink {
        sftp: Arc<Mutex<Sftp>>,
        file: Option<Arc<Mutex<ssh2::File>>>,
        tmp: String,
        target: String,
    }

    #[async_trait]
    impl ChunkSink for SftpSink {
        async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
            let file = self
                .file
                .clone()
                .ok_or_else(|| StorageError::Permanent("write after finish".to_string()))?;
            let data = chunk.to_vec();
            let shown = self.tmp.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = file
                    .lock()
                    .map_err(|_| StorageError::Permanent("SFTP file poisoned".to_string()))?;
                guard
                    .write_all(&data)
                    .map_err(|e| StorageError::from_io(e, &shown))
            })
            .await
            .map_err(|e| StorageError::Permanent(format!("SFTP task failed: {e}")))?
        }

        async fn finish(&mut self) -> Result<(), StorageError> {
            // Closing the handle flushes the remote file.
            self.file = None;
            let sftp = Arc::clone(&self.sftp);
            let (tmp, target) = (self.tmp.clone(), self.target.clone());
            tokio::task::spawn_blocking(move || {
                let guard = sftp
                    .lock()
                    .map_err(|_| StorageError::Permanent("SFTP channel poisoned".to_string()))?;
                guard
                    .rename(
                        Path::new(&tmp),
                        Path::new(&target),
                        Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
                    )
                    .map_err(|e| map_error(e, &target))
            })
            .await
            .map_err(|e| StorageError::Permanent(format!("SFTP task failed: {e}")))?
        }

        async fn abort(&mut self) {
            self.file = None;
            let sftp = Arc::clone(&self.sftp);
            let tmp = self.tmp.clone();
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(guard) = sftp.lock() {
                    let _ = guard.unlink(Path::new(&tmp));
                }
            })
            .await;
        }
    }
}
