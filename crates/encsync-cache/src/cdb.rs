//! Centralized database writer (CDB)
//!
//! Every database file gets exactly one [`Cdb`]: a named OS thread running a
//! current-thread runtime that owns the only `SqliteConnection` to the file.
//! Clients open logical [`Connection`]s that queue [`Request`]s to it and
//! await the reply on a oneshot channel.
//!
//! ```text
//! ┌──────────────┐   Request    ┌────────────────────────────┐
//! │ Connection 1 │ ───────────► │ primary queue (mpsc)       │
//! ├──────────────┤              │            │               │
//! │ Connection 2 │ ───────────► │            ▼               │
//! └──────────────┘              │   executor (cdb-<file>)    │──► SQLite
//!        ▲                      │     │ owner = conn 1       │
//!        │   reply (oneshot)    │     ▼                      │
//!        └───────────────────── │ deferred queue (conn 2)    │
//!                               └────────────────────────────┘
//! ```
//!
//! ## Isolation
//!
//! While a connection has an open `BEGIN`, it is the transaction owner and
//! requests from any other connection are moved to a deferred queue. They
//! run, in their original order, once the owner commits or rolls back.
//!
//! ## Backpressure
//!
//! When more than `queue_limit` requests are pending (primary plus deferred),
//! the CDB turns busy and producers wait until the backlog drops below the
//! limit, failing with [`CacheError::Busy`] after `busy_timeout`. The
//! transaction owner and the holder of the enqueue scope never wait.
//!
//! ## Autocommit
//!
//! Writes issued outside an explicit transaction are batched into an
//! implicit one that is committed as soon as the queue runs dry, and at
//! least every `autocommit` interval.
//!
//! ## Shutdown
//!
//! Connections keep their [`Cdb`] alive. When the last one is dropped the
//! queue closes and the executor exits after draining it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use encsync_core::config::DatabaseConfig;
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, SqliteConnection};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::value::{bind_all, decode_row, Row, SqlValue};
use crate::CacheError;

/// Identifier of a logical connection. `0` means "no connection".
type ConnId = u64;

const NO_OWNER: ConnId = 0;

// ============================================================================
// Options
// ============================================================================

/// Tuning of one CDB
#[derive(Debug, Clone)]
pub struct CdbOptions {
    /// Pending requests above which producers wait
    pub queue_limit: usize,
    /// How long a producer may wait for the backlog to drain
    pub busy_timeout: Duration,
    /// Longest lifetime of an implicit write batch
    pub autocommit: Duration,
    /// SQLite busy timeout for the underlying handle
    pub sqlite_busy_timeout: Duration,
}

impl Default for CdbOptions {
    fn default() -> Self {
        Self {
            queue_limit: 50,
            busy_timeout: Duration::from_secs(120),
            autocommit: Duration::from_millis(500),
            sqlite_busy_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&DatabaseConfig> for CdbOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            queue_limit: config.queue_limit,
            busy_timeout: Duration::from_secs(config.busy_timeout),
            ..Self::default()
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Execute,
    Script,
    FetchOne,
    FetchAll,
    FetchMany(usize),
    Begin,
    Commit,
    Rollback,
    SeamlessCommit,
    Close,
}

/// Outcome of a statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

#[derive(Debug)]
enum Reply {
    Done(ExecResult),
    Rows(Vec<Row>),
    Flag(bool),
}

struct Request {
    conn_id: ConnId,
    kind: RequestKind,
    sql: String,
    params: Vec<SqlValue>,
    /// `None` for fire-and-forget requests
    reply: Option<oneshot::Sender<Result<Reply, CacheError>>>,
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared between producers and the executor
struct Shared {
    pending: AtomicUsize,
    busy: AtomicBool,
    owner: AtomicU64,
    drained: Notify,
    queue_limit: usize,
}

impl Shared {
    fn new(queue_limit: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            drained: Notify::new(),
            queue_limit: queue_limit.max(1),
        }
    }

    fn added(&self) {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > self.queue_limit {
            self.busy.store(true, Ordering::SeqCst);
        }
    }

    fn completed(&self) {
        let pending = self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if pending < self.queue_limit && self.busy.swap(false, Ordering::SeqCst) {
            self.drained.notify_waiters();
        }
    }
}

// ============================================================================
// Cdb
// ============================================================================

/// The single writer of one database file
pub struct Cdb {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
    enqueue_lock: Arc<Mutex<()>>,
    next_conn_id: AtomicU64,
    options: CdbOptions,
}

impl std::fmt::Debug for Cdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cdb")
            .field("path", &self.path)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Cdb {
    /// Starts the executor thread for `path` and waits until the database
    /// is open. `:memory:` opens a private in-memory database.
    pub async fn open(path: &Path, options: CdbOptions) -> Result<Arc<Self>, CacheError> {
        let in_memory = path.as_os_str() == ":memory:";
        let connect_options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| CacheError::Connection(e.to_string()))?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::Connection(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        let connect_options = connect_options.busy_timeout(options.sqlite_busy_timeout);

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(options.queue_limit));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_name = format!(
            "cdb-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "memory".to_string())
        );
        let executor_shared = Arc::clone(&shared);
        let autocommit = options.autocommit;
        let display_path = path.to_path_buf();

        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(CacheError::Connection(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let conn = match connect_options.connect().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            let _ = ready_tx.send(Err(CacheError::Connection(format!(
                                "Failed to open database at {}: {}",
                                display_path.display(),
                                e
                            ))));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    Executor::new(conn, rx, executor_shared, autocommit, display_path)
                        .run()
                        .await;
                });
            })
            .map_err(|e| CacheError::Connection(format!("Failed to spawn executor: {e}")))?;

        ready_rx.await.map_err(|_| CacheError::Closed)??;

        info!(path = %path.display(), "Database executor started");

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            tx,
            shared,
            enqueue_lock: Arc::new(Mutex::new(())),
            next_conn_id: AtomicU64::new(1),
            options,
        }))
    }

    /// Opens a private in-memory database.
    pub async fn memory() -> Result<Arc<Self>, CacheError> {
        Self::open(Path::new(":memory:"), CdbOptions::default()).await
    }

    /// Opens a new logical connection.
    pub fn connect(self: &Arc<Self>) -> Connection {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        trace!(path = %self.path.display(), conn = id, "Connection opened");
        Connection {
            inner: Arc::new(ConnInner {
                id,
                cdb: Arc::clone(self),
                scope: StdMutex::new(ScopeState::default()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Requests queued or deferred and not yet executed.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Waits out backpressure. The transaction owner is never held back.
    async fn wait_ready(&self, conn_id: ConnId) -> Result<(), CacheError> {
        if self.shared.owner.load(Ordering::SeqCst) == conn_id {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + self.options.busy_timeout;
        loop {
            let drained = self.shared.drained.notified();
            if !self.shared.busy.load(Ordering::SeqCst)
                || self.shared.owner.load(Ordering::SeqCst) == conn_id
            {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(path = %self.path.display(), pending = self.pending(), "Database busy");
                return Err(CacheError::Busy);
            }
        }
    }

    fn send(&self, request: Request) -> Result<(), CacheError> {
        self.shared.added();
        self.tx.send(request).map_err(|_| {
            self.shared.completed();
            CacheError::Closed
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide map from database file to its CDB
///
/// The registry only holds weak references, so a CDB shuts down as soon as
/// its last connection is dropped and is restarted by the next `connect`.
#[derive(Default)]
pub struct CdbRegistry {
    dbs: DashMap<PathBuf, Weak<Cdb>>,
    open_lock: Mutex<()>,
    options: CdbOptions,
}

impl CdbRegistry {
    pub fn new(options: CdbOptions) -> Self {
        Self {
            dbs: DashMap::new(),
            open_lock: Mutex::new(()),
            options,
        }
    }

    /// Returns the CDB of `path`, starting it if needed.
    pub async fn cdb(&self, path: &Path) -> Result<Arc<Cdb>, CacheError> {
        let key = normalize_key(path);
        if let Some(cdb) = self.dbs.get(&key).and_then(|weak| weak.upgrade()) {
            return Ok(cdb);
        }

        let _guard = self.open_lock.lock().await;
        if let Some(cdb) = self.dbs.get(&key).and_then(|weak| weak.upgrade()) {
            return Ok(cdb);
        }
        let cdb = Cdb::open(&key, self.options.clone()).await?;
        self.dbs.insert(key, Arc::downgrade(&cdb));
        self.dbs.retain(|_, weak| weak.strong_count() > 0);
        Ok(cdb)
    }

    /// Opens a logical connection to `path`.
    pub async fn connect(&self, path: &Path) -> Result<Connection, CacheError> {
        Ok(self.cdb(path).await?.connect())
    }

    /// Number of running executors.
    pub fn open_count(&self) -> usize {
        self.dbs
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

fn normalize_key(path: &Path) -> PathBuf {
    if path.as_os_str() == ":memory:" || path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Default)]
struct ScopeState {
    depth: usize,
    guard: Option<OwnedMutexGuard<()>>,
}

struct ConnInner {
    id: ConnId,
    cdb: Arc<Cdb>,
    scope: StdMutex<ScopeState>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        let request = Request {
            conn_id: self.id,
            kind: RequestKind::Close,
            sql: String::new(),
            params: Vec::new(),
            reply: None,
        };
        let _ = self.cdb.send(request);
    }
}

/// A logical connection to a CDB
///
/// Clones share the same logical connection (and therefore the same
/// transaction). Dropping the last clone closes it, rolling back any
/// transaction it still owns.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("path", &self.inner.cdb.path)
            .finish()
    }
}

/// Scoped hold on the enqueue lock; see [`Connection::scope`].
pub struct ScopeGuard {
    conn: Connection,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Ok(mut scope) = self.conn.inner.scope.lock() {
            scope.depth = scope.depth.saturating_sub(1);
            if scope.depth == 0 {
                scope.guard = None;
            }
        }
    }
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cdb(&self) -> &Arc<Cdb> {
        &self.inner.cdb
    }

    /// Whether this connection owns the open transaction.
    pub fn in_transaction(&self) -> bool {
        self.inner.cdb.shared.owner.load(Ordering::SeqCst) == self.inner.id
    }

    fn holds_scope(&self) -> bool {
        self.inner
            .scope
            .lock()
            .map(|scope| scope.depth > 0)
            .unwrap_or(false)
    }

    /// Takes the CDB-wide enqueue lock until the guard is dropped, so the
    /// statements issued meanwhile are contiguous in the queue. Re-entrant
    /// for the same connection.
    pub async fn scope(&self) -> ScopeGuard {
        if let Ok(mut scope) = self.inner.scope.lock() {
            if scope.depth > 0 {
                scope.depth += 1;
                return ScopeGuard { conn: self.clone() };
            }
        }

        let guard = Arc::clone(&self.inner.cdb.enqueue_lock).lock_owned().await;
        if let Ok(mut scope) = self.inner.scope.lock() {
            scope.depth += 1;
            if scope.guard.is_none() {
                scope.guard = Some(guard);
            }
        }
        ScopeGuard { conn: self.clone() }
    }

    async fn enqueue(
        &self,
        kind: RequestKind,
        sql: String,
        params: Vec<SqlValue>,
        reply: Option<oneshot::Sender<Result<Reply, CacheError>>>,
    ) -> Result<(), CacheError> {
        let cdb = &self.inner.cdb;
        let request = Request {
            conn_id: self.inner.id,
            kind,
            sql,
            params,
            reply,
        };

        if self.holds_scope() {
            return cdb.send(request);
        }
        cdb.wait_ready(self.inner.id).await?;
        let _lock = cdb.enqueue_lock.lock().await;
        cdb.send(request)
    }

    async fn request(
        &self,
        kind: RequestKind,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<Reply, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(kind, sql.into(), params, Some(tx)).await?;
        rx.await.map_err(|_| CacheError::Closed)?
    }

    /// Executes one statement.
    pub async fn execute(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<ExecResult, CacheError> {
        match self.request(RequestKind::Execute, sql, params).await? {
            Reply::Done(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Queues one statement without waiting for it. Failures are logged by
    /// the executor.
    pub async fn execute_nowait(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<(), CacheError> {
        self.enqueue(RequestKind::Execute, sql.into(), params, None)
            .await
    }

    /// Executes several `;`-separated statements without parameters.
    pub async fn execute_script(&self, sql: impl Into<String>) -> Result<(), CacheError> {
        match self.request(RequestKind::Script, sql, Vec::new()).await? {
            Reply::Done(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn fetch_one(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<Option<Row>, CacheError> {
        match self.request(RequestKind::FetchOne, sql, params).await? {
            Reply::Rows(rows) => Ok(rows.into_iter().next()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn fetch_all(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<Vec<Row>, CacheError> {
        match self.request(RequestKind::FetchAll, sql, params).await? {
            Reply::Rows(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches at most `n` rows.
    pub async fn fetch_many(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
        n: usize,
    ) -> Result<Vec<Row>, CacheError> {
        match self.request(RequestKind::FetchMany(n), sql, params).await? {
            Reply::Rows(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    /// Opens an `IMMEDIATE` transaction owned by this connection.
    pub async fn begin(&self) -> Result<(), CacheError> {
        self.request(RequestKind::Begin, "", Vec::new()).await?;
        Ok(())
    }

    /// Commits the owned transaction. A no-op without one.
    pub async fn commit(&self) -> Result<(), CacheError> {
        self.request(RequestKind::Commit, "", Vec::new()).await?;
        Ok(())
    }

    /// Rolls back the owned transaction. A no-op without one.
    pub async fn rollback(&self) -> Result<(), CacheError> {
        self.request(RequestKind::Rollback, "", Vec::new()).await?;
        Ok(())
    }

    /// Commits and immediately reopens the owned transaction, keeping write
    /// ownership. Returns false when no transaction was open.
    pub async fn seamless_commit(&self) -> Result<bool, CacheError> {
        match self
            .request(RequestKind::SeamlessCommit, "", Vec::new())
            .await?
        {
            Reply::Flag(committed) => Ok(committed),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> CacheError {
    CacheError::Query(format!("unexpected executor reply: {reply:?}"))
}

// ============================================================================
// Executor
// ============================================================================

struct Executor {
    conn: SqliteConnection,
    rx: mpsc::UnboundedReceiver<Request>,
    deferred: VecDeque<Request>,
    lookahead: Option<Request>,
    shared: Arc<Shared>,
    owner: Option<ConnId>,
    implicit_since: Option<Instant>,
    autocommit: Duration,
    path: PathBuf,
}

impl Executor {
    fn new(
        conn: SqliteConnection,
        rx: mpsc::UnboundedReceiver<Request>,
        shared: Arc<Shared>,
        autocommit: Duration,
        path: PathBuf,
    ) -> Self {
        Self {
            conn,
            rx,
            deferred: VecDeque::new(),
            lookahead: None,
            shared,
            owner: None,
            implicit_since: None,
            autocommit,
            path,
        }
    }

    async fn run(mut self) {
        debug!(path = %self.path.display(), "Executor running");

        loop {
            let request = match self.next_request().await {
                Some(request) => request,
                None => break,
            };

            if let Some(owner) = self.owner {
                if request.conn_id != owner {
                    trace!(conn = request.conn_id, owner, "Deferring request");
                    self.deferred.push_back(request);
                    continue;
                }
            }

            self.process(request).await;
            self.shared.completed();
            self.maybe_autocommit().await;
        }

        self.end_implicit().await;
        if self.owner.take().is_some() {
            self.raw("ROLLBACK").await.ok();
        }
        debug!(path = %self.path.display(), "Executor stopped (all connections closed)");
    }

    /// Picks the next request: runnable deferred ones first, then the
    /// lookahead slot, then the primary queue.
    async fn next_request(&mut self) -> Option<Request> {
        loop {
            let runnable = match self.owner {
                None => (!self.deferred.is_empty()).then_some(0),
                Some(owner) => self.deferred.iter().position(|r| r.conn_id == owner),
            };
            if let Some(idx) = runnable {
                return self.deferred.remove(idx);
            }
            if let Some(request) = self.lookahead.take() {
                return Some(request);
            }
            if self.implicit_since.is_some() {
                match self.rx.try_recv() {
                    Ok(request) => return Some(request),
                    Err(_) => self.end_implicit().await,
                }
            }
            match self.rx.recv().await {
                Some(request) => return Some(request),
                None if self.deferred.is_empty() => return None,
                None => {
                    // Only requests of closed connections are left behind a
                    // transaction nobody can finish.
                    warn!(path = %self.path.display(), "Abandoned transaction rolled back");
                    self.owner = None;
                    self.shared.owner.store(NO_OWNER, Ordering::SeqCst);
                    self.raw("ROLLBACK").await.ok();
                }
            }
        }
    }

    async fn process(&mut self, request: Request) {
        let Request {
            conn_id,
            kind,
            sql,
            params,
            reply,
        } = request;

        let result = match kind {
            RequestKind::Execute => self.execute(&sql, &params).await.map(Reply::Done),
            RequestKind::Script => self.script(&sql).await.map(Reply::Done),
            RequestKind::FetchOne => self.fetch(&sql, &params, Some(1)).await.map(Reply::Rows),
            RequestKind::FetchAll => self.fetch(&sql, &params, None).await.map(Reply::Rows),
            RequestKind::FetchMany(n) => self.fetch(&sql, &params, Some(n)).await.map(Reply::Rows),
            RequestKind::Begin => self.begin(conn_id).await.map(|_| Reply::Flag(true)),
            RequestKind::Commit => self.commit(conn_id).await.map(Reply::Flag),
            RequestKind::Rollback => self.rollback(conn_id).await.map(Reply::Flag),
            RequestKind::SeamlessCommit => self.seamless_commit(conn_id).await.map(Reply::Flag),
            RequestKind::Close => self.close(conn_id).await.map(Reply::Flag),
        };

        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    error!(path = %self.path.display(), conn = conn_id, error = %e, sql = %sql, "Queued statement failed");
                }
            }
        }
    }

    async fn raw(&mut self, sql: &str) -> Result<(), CacheError> {
        sqlx::raw_sql(sql).execute(&mut self.conn).await?;
        Ok(())
    }

    fn set_owner(&mut self, owner: Option<ConnId>) {
        self.owner = owner;
        self.shared
            .owner
            .store(owner.unwrap_or(NO_OWNER), Ordering::SeqCst);
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, CacheError> {
        if self.owner.is_none() {
            if is_batchable(sql) {
                self.start_implicit().await?;
            } else {
                self.end_implicit().await;
            }
        }
        let result = bind_all(sql, params).execute(&mut self.conn).await?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_rowid(),
        })
    }

    async fn script(&mut self, sql: &str) -> Result<ExecResult, CacheError> {
        if self.owner.is_none() {
            self.end_implicit().await;
        }
        let result = sqlx::raw_sql(sql).execute(&mut self.conn).await?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_rowid(),
        })
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, CacheError> {
        let mut rows = Vec::new();
        let mut stream = bind_all(sql, params).fetch(&mut self.conn);
        while limit.map_or(true, |n| rows.len() < n) {
            match stream.try_next().await? {
                Some(row) => rows.push(decode_row(&row)?),
                None => break,
            }
        }
        Ok(rows)
    }

    async fn begin(&mut self, conn_id: ConnId) -> Result<(), CacheError> {
        if self.owner == Some(conn_id) {
            return Err(CacheError::Transaction(
                "connection already owns a transaction".to_string(),
            ));
        }
        self.end_implicit().await;
        self.raw("BEGIN IMMEDIATE").await?;
        self.set_owner(Some(conn_id));
        trace!(conn = conn_id, "Transaction started");
        Ok(())
    }

    async fn commit(&mut self, conn_id: ConnId) -> Result<bool, CacheError> {
        if self.owner != Some(conn_id) {
            return Ok(false);
        }
        let result = self.raw("COMMIT").await;
        if result.is_err() {
            self.raw("ROLLBACK").await.ok();
        }
        self.set_owner(None);
        result.map(|_| true)
    }

    async fn rollback(&mut self, conn_id: ConnId) -> Result<bool, CacheError> {
        if self.owner != Some(conn_id) {
            return Ok(false);
        }
        self.set_owner(None);
        self.raw("ROLLBACK").await?;
        Ok(true)
    }

    async fn seamless_commit(&mut self, conn_id: ConnId) -> Result<bool, CacheError> {
        if self.owner != Some(conn_id) {
            return Ok(false);
        }
        if let Err(e) = self.raw("COMMIT").await {
            self.raw("ROLLBACK").await.ok();
            self.set_owner(None);
            return Err(e);
        }
        if let Err(e) = self.raw("BEGIN IMMEDIATE").await {
            self.set_owner(None);
            return Err(e);
        }
        trace!(conn = conn_id, "Seamless commit");
        Ok(true)
    }

    async fn close(&mut self, conn_id: ConnId) -> Result<bool, CacheError> {
        if self.owner == Some(conn_id) {
            debug!(conn = conn_id, "Closed connection owned a transaction, rolling back");
            return self.rollback(conn_id).await;
        }
        Ok(false)
    }

    async fn start_implicit(&mut self) -> Result<(), CacheError> {
        if self.implicit_since.is_none() {
            self.raw("BEGIN").await?;
            self.implicit_since = Some(Instant::now());
        }
        Ok(())
    }

    async fn end_implicit(&mut self) {
        if self.implicit_since.take().is_some() {
            if let Err(e) = self.raw("COMMIT").await {
                error!(path = %self.path.display(), error = %e, "Autocommit failed");
                self.raw("ROLLBACK").await.ok();
            }
        }
    }

    async fn maybe_autocommit(&mut self) {
        let Some(since) = self.implicit_since else {
            return;
        };
        if since.elapsed() >= self.autocommit {
            self.end_implicit().await;
            return;
        }
        if self.lookahead.is_none() {
            match self.rx.try_recv() {
                Ok(request) => self.lookahead = Some(request),
                Err(_) => self.end_implicit().await,
            }
        }
    }
}

/// Plain data-modifying statements may share an implicit transaction.
fn is_batchable(sql: &str) -> bool {
    let head: String = sql
        .trim_start()
        .chars()
        .take(7)
        .collect::<String>()
        .to_ascii_uppercase();
    ["INSERT", "UPDATE", "DELETE", "REPLACE"]
        .iter()
        .any(|kw| head.starts_with(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batchable_statements() {
        assert!(is_batchable("insert into t values (1)"));
        assert!(is_batchable("  DELETE FROM t"));
        assert!(!is_batchable("VACUUM INTO 'x'"));
        assert!(!is_batchable("CREATE TABLE t(x)"));
    }

    #[test]
    fn shared_state_turns_busy_above_limit() {
        let shared = Shared::new(2);
        shared.added();
        shared.added();
        assert!(!shared.busy.load(Ordering::SeqCst));
        shared.added();
        assert!(shared.busy.load(Ordering::SeqCst));
        shared.completed();
        assert!(shared.busy.load(Ordering::SeqCst));
        shared.completed();
        assert!(!shared.busy.load(Ordering::SeqCst));
    }
}
