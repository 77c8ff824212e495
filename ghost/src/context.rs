//! `MigrationContext` — the single source of truth for configuration and
//! runtime state, shared across every task described in §5. The teacher's
//! own code leans on a process-wide singleton for this kind of shared
//! state; per SPEC_FULL §9 / DESIGN.md this is re-architected as an
//! explicit value held behind an `Arc`, passed to every component instead
//! of reached for globally.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::coordinates::BinlogCoordinates;
use crate::model::{ChunkIteratorState, ColumnList, UniqueKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    RowCopy,
    ReplayOnly,
    CutOver,
    Done,
    Aborted,
}

/// Connection parameters for one MySQL endpoint (inspector or applier
/// host).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// User-settable knobs, mutable mid-run via the control channel (§4.7).
/// Structural (non-atomic) fields sit behind a short-critical-section
/// mutex; no I/O ever happens while the lock is held.
#[derive(Debug, Clone)]
pub struct TunableParams {
    pub chunk_size: u32,
    pub dml_batch_size: u32,
    pub max_lag_millis: u64,
    pub nice_ratio: f64,
    pub max_load: Option<String>,
    pub critical_load: Option<String>,
    pub throttle_query: Option<String>,
    pub throttle_http: Option<String>,
}

impl Default for TunableParams {
    fn default() -> Self {
        TunableParams {
            chunk_size: 1000,
            dml_batch_size: 10,
            max_lag_millis: 1500,
            nice_ratio: 0.0,
            max_load: None,
            critical_load: None,
            throttle_query: None,
            throttle_http: None,
        }
    }
}

/// Process-wide mutable record holding configuration and runtime state,
/// threaded explicitly through every component rather than reached for as
/// a global (SPEC_FULL §9, Open Question resolution in DESIGN.md).
pub struct MigrationContext {
    pub inspector_conn: ConnectionConfig,
    pub applier_conn: ConnectionConfig,
    pub database: String,
    pub table: String,
    pub alter: String,

    pub default_retries: u32,
    pub cut_over_lock_timeout_seconds: u32,
    pub heartbeat_interval_millis: u64,
    pub replica_server_id: u32,

    tunables: Mutex<TunableParams>,
    phase: Mutex<Phase>,
    shared_key: Mutex<Option<UniqueKey>>,
    original_columns: Mutex<Option<ColumnList>>,
    shadow_columns: Mutex<Option<ColumnList>>,
    chunk_iterator: Mutex<ChunkIteratorState>,

    rows_copied: AtomicU64,
    events_applied: AtomicU64,
    lag_millis: AtomicU64,
    last_applied_coordinate: Mutex<Option<BinlogCoordinates>>,
    heartbeat_timestamp_secs: AtomicU64,

    throttle: watch::Sender<(bool, String)>,
    throttle_rx: watch::Receiver<(bool, String)>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    panicked: AtomicBool,
}

impl MigrationContext {
    pub fn new(
        inspector_conn: ConnectionConfig,
        applier_conn: ConnectionConfig,
        database: String,
        table: String,
        alter: String,
    ) -> Arc<Self> {
        Self::new_with_options(inspector_conn, applier_conn, database, table, alter, 60, 3, 100, 99999, TunableParams::default())
    }

    /// As `new`, but with every CLI-settable fixed field (those that are
    /// not mid-run tunable via the control channel, §4.7) supplied up
    /// front instead of defaulted.
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_options(
        inspector_conn: ConnectionConfig,
        applier_conn: ConnectionConfig,
        database: String,
        table: String,
        alter: String,
        default_retries: u32,
        cut_over_lock_timeout_seconds: u32,
        heartbeat_interval_millis: u64,
        replica_server_id: u32,
        tunables: TunableParams,
    ) -> Arc<Self> {
        let (throttle, throttle_rx) = watch::channel((false, String::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        Arc::new(MigrationContext {
            inspector_conn,
            applier_conn,
            database,
            table,
            alter,
            default_retries,
            cut_over_lock_timeout_seconds,
            heartbeat_interval_millis,
            replica_server_id,
            tunables: Mutex::new(tunables),
            phase: Mutex::new(Phase::Setup),
            shared_key: Mutex::new(None),
            original_columns: Mutex::new(None),
            shadow_columns: Mutex::new(None),
            chunk_iterator: Mutex::new(ChunkIteratorState::default()),
            rows_copied: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            lag_millis: AtomicU64::new(0),
            last_applied_coordinate: Mutex::new(None),
            heartbeat_timestamp_secs: AtomicU64::new(0),
            throttle,
            throttle_rx,
            shutdown,
            shutdown_rx,
            panicked: AtomicBool::new(false),
        })
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.lock().await
    }

    pub async fn set_phase(&self, phase: Phase) {
        *self.phase.lock().await = phase;
    }

    pub async fn tunables(&self) -> TunableParams {
        self.tunables.lock().await.clone()
    }

    pub async fn update_tunables(&self, f: impl FnOnce(&mut TunableParams)) {
        let mut guard = self.tunables.lock().await;
        f(&mut guard);
    }

    pub async fn set_shared_key(&self, key: UniqueKey) {
        *self.shared_key.lock().await = Some(key);
    }

    pub async fn shared_key(&self) -> Option<UniqueKey> {
        self.shared_key.lock().await.clone()
    }

    pub async fn set_original_columns(&self, columns: ColumnList) {
        *self.original_columns.lock().await = Some(columns);
    }

    pub async fn original_columns(&self) -> Option<ColumnList> {
        self.original_columns.lock().await.clone()
    }

    pub async fn set_shadow_columns(&self, columns: ColumnList) {
        *self.shadow_columns.lock().await = Some(columns);
    }

    pub async fn shadow_columns(&self) -> Option<ColumnList> {
        self.shadow_columns.lock().await.clone()
    }

    pub async fn advance_chunk_iterator(&self, new_max: Vec<mysql_common::Value>) {
        self.chunk_iterator.lock().await.advance_to(new_max);
    }

    pub async fn chunk_iterator_high_water_mark(&self) -> Option<Vec<mysql_common::Value>> {
        self.chunk_iterator.lock().await.high_water_mark().map(|s| s.to_vec())
    }

    pub fn rows_copied(&self) -> u64 {
        self.rows_copied.load(Ordering::Relaxed)
    }

    pub fn add_rows_copied(&self, n: u64) {
        self.rows_copied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    pub fn add_events_applied(&self, n: u64) {
        self.events_applied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn lag_millis(&self) -> u64 {
        self.lag_millis.load(Ordering::Relaxed)
    }

    pub fn set_lag_millis(&self, v: u64) {
        self.lag_millis.store(v, Ordering::Relaxed);
    }

    /// Only ever moves forward (§5: "the last-applied coordinate only
    /// advances").
    pub async fn advance_last_applied_coordinate(&self, coord: BinlogCoordinates) {
        *self.last_applied_coordinate.lock().await = Some(coord);
    }

    pub async fn last_applied_coordinate(&self) -> Option<BinlogCoordinates> {
        self.last_applied_coordinate.lock().await.clone()
    }

    pub fn set_heartbeat_timestamp(&self, secs: u64) {
        self.heartbeat_timestamp_secs.store(secs, Ordering::Relaxed);
    }

    pub fn heartbeat_timestamp(&self) -> u64 {
        self.heartbeat_timestamp_secs.load(Ordering::Relaxed)
    }

    /// Publishes the throttler's decision; read by row-copy and replay
    /// before starting any transaction (§4.5).
    pub fn publish_throttle(&self, throttled: bool, reason: String) {
        let _ = self.throttle.send((throttled, reason));
    }

    pub fn throttle_decision(&self) -> (bool, String) {
        self.throttle_rx.borrow().clone()
    }

    pub fn subscribe_throttle(&self) -> watch::Receiver<(bool, String)> {
        self.throttle_rx.clone()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn set_panicked(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }
}
