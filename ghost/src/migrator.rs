//! Drives the migration through its phases, multiplexing row-copy,
//! DML-replay, throttle-decision changes, and a shutdown signal in a
//! single event loop — no busy waiting (§9).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, instrument, warn};

use crate::applier::{Applier, CutOverDrainStep, CutOverStyle};
use crate::context::{MigrationContext, Phase};
use crate::error::GhostError;
use crate::hooks::{base_env, HookPoint, Hooks};
use crate::model::{old_table_name, BinlogDmlEvent};
use crate::streamer::{ChangelogSignal, StreamItem};

pub struct MigratorOptions {
    pub cut_over: CutOverStyle,
    pub ok_to_drop_table: bool,
    pub timestamp_old_table: bool,
    /// `--test-on-replica` / `--migrate-on-replica`: after a successful
    /// cut-over, immediately swap the original back into place instead of
    /// leaving the shadow table live (§4.6). Assumes replication into
    /// this host has already been stopped by an external mechanism
    /// (`--test-on-replica-skip-replica-stop`'s documented precondition,
    /// SPEC_FULL.md §9).
    pub test_on_replica: bool,
    /// `--postpone-cut-over-flag-file`: once row-copy and replay have
    /// caught up, hold in `replay-only` rather than proceeding to
    /// `cut-over` while the file exists (§4.6).
    pub postpone_cut_over_flag_file: Option<PathBuf>,
}

pub struct Migrator {
    ctx: Arc<MigrationContext>,
    applier: Applier,
    hooks: Arc<Hooks>,
    options: MigratorOptions,
    events_rx: mpsc::Receiver<StreamItem>,
    shadow_table: String,
    key_columns: Vec<String>,
    /// Original-side names of the shared columns, paired positionally with
    /// `shared_columns.names()` — see `Applier::copy_chunk`.
    original_columns: Vec<String>,
    shared_columns: crate::model::ColumnList,
}

impl Migrator {
    pub fn new(
        ctx: Arc<MigrationContext>,
        applier: Applier,
        hooks: Arc<Hooks>,
        options: MigratorOptions,
        events_rx: mpsc::Receiver<StreamItem>,
        shadow_table: String,
        key_columns: Vec<String>,
        original_columns: Vec<String>,
        shared_columns: crate::model::ColumnList,
    ) -> Self {
        Migrator {
            ctx,
            applier,
            hooks,
            options,
            events_rx,
            shadow_table,
            key_columns,
            original_columns,
            shared_columns,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<(), GhostError> {
        self.hooks
            .invoke(HookPoint::OnStartup, &base_env(&self.ctx.database, &self.ctx.table, &self.ctx.alter, 0))
            .await?;

        let result = self.drive().await;

        match &result {
            Ok(()) => {
                self.ctx.set_phase(Phase::Done).await;
                if self.options.ok_to_drop_table {
                    let old = old_table_name(&self.ctx.table, self.options.timestamp_old_table);
                    self.applier.drop_table(&self.ctx.database, &old).await?;
                }
                self.hooks
                    .invoke(HookPoint::OnSuccess, &base_env(&self.ctx.database, &self.ctx.table, &self.ctx.alter, self.ctx.rows_copied()))
                    .await?;
            }
            Err(e) => {
                warn!(error = %e, "migration failed");
                self.ctx.set_phase(Phase::Aborted).await;
                self.hooks
                    .invoke(HookPoint::OnFailure, &base_env(&self.ctx.database, &self.ctx.table, &self.ctx.alter, self.ctx.rows_copied()))
                    .await?;
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<(), GhostError> {
        self.ctx.set_phase(Phase::RowCopy).await;
        self.hooks
            .invoke(HookPoint::OnValidated, &base_env(&self.ctx.database, &self.ctx.table, &self.ctx.alter, 0))
            .await?;

        self.row_copy_loop().await?;

        self.hooks
            .invoke(
                HookPoint::OnRowCopyComplete,
                &base_env(&self.ctx.database, &self.ctx.table, &self.ctx.alter, self.ctx.rows_copied()),
            )
            .await?;

        self.ctx.set_phase(Phase::ReplayOnly).await;
        self.replay_only_loop().await?;
        self.wait_while_postponed().await?;

        self.ctx.set_phase(Phase::CutOver).await;
        self.hooks
            .invoke(HookPoint::OnBeforeCutOver, &base_env(&self.ctx.database, &self.ctx.table, &self.ctx.alter, self.ctx.rows_copied()))
            .await?;
        self.cut_over_with_retries().await
    }

    /// Loop: if throttled, sleep; else copy the next chunk; on completion,
    /// drain queued DML events (bounded so row-copy keeps making
    /// progress); heartbeat on its own interval; sleep `nice_ratio ×
    /// chunk_time` between chunks.
    async fn row_copy_loop(&mut self) -> Result<(), GhostError> {
        let mut heartbeat = interval(Duration::from_millis(self.ctx.heartbeat_interval_millis));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.ctx.subscribe_shutdown();

        loop {
            if *shutdown_rx.borrow() {
                return Err(GhostError::Cancellation("shutdown requested during row-copy".to_string()));
            }
            if self.ctx.is_panicked() {
                return Err(GhostError::PanicFlag("panic requested during row-copy".to_string()));
            }

            let (throttled, _reason) = self.ctx.throttle_decision();
            if throttled {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            let tunables = self.ctx.tunables().await;
            let last_max = self.ctx.chunk_iterator_high_water_mark().await;
            let started = std::time::Instant::now();
            let new_max = self
                .applier
                .copy_chunk(
                    &self.ctx.database,
                    &self.ctx.table,
                    &self.shadow_table,
                    &self.key_columns,
                    &self.original_columns,
                    &self.shared_columns.names().iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    last_max.as_deref(),
                    tunables.chunk_size,
                )
                .await?;
            let chunk_time = started.elapsed();

            match new_max {
                Some(max) => {
                    self.ctx.advance_chunk_iterator(max).await;
                    self.ctx.add_rows_copied(tunables.chunk_size as u64);
                }
                None => break,
            }

            self.drain_available_events(tunables.dml_batch_size).await?;

            if heartbeat.period().as_millis() > 0 && heartbeat.tick().now_or_never().is_some() {
                self.applier
                    .write_changelog(&self.ctx.database, &self.ctx.table, "heartbeat", &chrono::Utc::now().to_rfc3339())
                    .await?;
            }

            if tunables.nice_ratio > 0.0 {
                let sleep_for = chunk_time.mul_f64(tunables.nice_ratio / 100.0);
                tokio::time::sleep(sleep_for).await;
            }
        }
        Ok(())
    }

    /// Drains up to a bounded number of batches from the event queue so
    /// row-copy keeps making forward progress even under heavy write load.
    async fn drain_available_events(&mut self, dml_batch_size: u32) -> Result<(), GhostError> {
        const MAX_BATCHES_PER_CHUNK: usize = 4;
        for _ in 0..MAX_BATCHES_PER_CHUNK {
            let mut batch = Vec::new();
            while batch.len() < dml_batch_size as usize {
                match self.events_rx.try_recv() {
                    Ok(item) => {
                        if let Some(event) = self.handle_stream_item(item) {
                            batch.push(event);
                        }
                    }
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            self.apply_batch(batch).await?;
        }
        Ok(())
    }

    /// Blocks until queued events are drained, used once row-copy is done
    /// (§4.6 `replay-only`).
    async fn replay_only_loop(&mut self) -> Result<(), GhostError> {
        loop {
            let tunables = self.ctx.tunables().await;
            let (throttled, _) = self.ctx.throttle_decision();
            if throttled {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            let mut batch = Vec::new();
            while batch.len() < tunables.dml_batch_size as usize {
                match self.events_rx.try_recv() {
                    Ok(item) => {
                        if let Some(event) = self.handle_stream_item(item) {
                            batch.push(event);
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }
            if !batch.is_empty() {
                self.apply_batch(batch).await?;
                continue;
            }

            let caught_up = self.ctx.lag_millis() < tunables.max_lag_millis;
            if caught_up {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Holds in `replay-only` while `--postpone-cut-over-flag-file` exists,
    /// continuing to drain newly arrived events so the shadow table stays
    /// caught up for however long the operator postpones (§4.6).
    async fn wait_while_postponed(&mut self) -> Result<(), GhostError> {
        let Some(flag_file) = self.options.postpone_cut_over_flag_file.clone() else {
            return Ok(());
        };
        while flag_file.exists() {
            if self.ctx.is_shutdown() {
                return Err(GhostError::Cancellation("shutdown requested while cut-over was postponed".to_string()));
            }
            self.replay_only_loop().await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }

    fn handle_stream_item(&mut self, item: StreamItem) -> Option<BinlogDmlEvent> {
        match item {
            StreamItem::Dml(event) => Some(event),
            // Heartbeats and (outside the cut-over drain, where it is
            // tracked separately, see `cut_over_with_retries`) the
            // sentinel echo carry no row-copy/replay work of their own.
            StreamItem::Changelog(_, _) => None,
        }
    }

    async fn apply_batch(&mut self, mut batch: Vec<BinlogDmlEvent>) -> Result<(), GhostError> {
        // Statements within a batch are ordered by source binlog position.
        batch.sort_by(|a, b| {
            let (
                crate::coordinates::BinlogCoordinates::File { log_pos: pa, .. },
                crate::coordinates::BinlogCoordinates::File { log_pos: pb, .. },
            ) = (&a.coordinates, &b.coordinates)
            else {
                return std::cmp::Ordering::Equal;
            };
            pa.cmp(pb)
        });
        let last_coord = batch.last().map(|e| e.coordinates.clone());

        self.applier
            .apply_dml_batch(&self.ctx.database, &self.shadow_table, &self.key_columns, &self.shared_columns, &batch)
            .await?;

        self.ctx.add_events_applied(batch.len() as u64);
        if let Some(coord) = last_coord {
            self.ctx.advance_last_applied_coordinate(coord).await;
        }
        Ok(())
    }

    /// Writes the cut-over sentinel, then attempts the configured
    /// cut-over style, retrying transient failures up to
    /// `default_retries`.
    async fn cut_over_with_retries(&mut self) -> Result<(), GhostError> {
        self.applier
            .write_changelog(&self.ctx.database, &self.ctx.table, "cut-over-sentinel", &uuid::Uuid::new_v4().to_string())
            .await?;

        let mut attempt = 0;
        loop {
            let outcome = match self.options.cut_over {
                CutOverStyle::TwoStep => {
                    let old = old_table_name(&self.ctx.table, self.options.timestamp_old_table);
                    self.applier
                        .cut_over_two_step(&self.ctx.database, &self.ctx.table, &self.shadow_table, &old)
                        .await
                        .map(|()| Vec::new())
                }
                CutOverStyle::Atomic => {
                    let old = old_table_name(&self.ctx.table, self.options.timestamp_old_table);
                    // Events already in flight when the lock was taken must
                    // still reach the shadow table before the rename — but
                    // only the session holding `LOCK TABLES` may write to
                    // the locked tables, so `cut_over_atomic` drains the
                    // queue itself via this callback and applies each event
                    // on its own locked session (§4.3 step (b)). Once the
                    // sentinel changelog row has been dequeued, every event
                    // that preceded it in the binlog stream has already been
                    // popped (the channel is FIFO in source order), so no
                    // coordinate comparison is needed here.
                    let events_rx = &mut self.events_rx;
                    let mut sentinel_seen = false;
                    let next_step = move || next_cut_over_drain_step(events_rx, &mut sentinel_seen);
                    self.applier
                        .cut_over_atomic(
                            &self.ctx.database,
                            &self.ctx.table,
                            &self.shadow_table,
                            &old,
                            &self.key_columns,
                            &self.shared_columns,
                            self.ctx.cut_over_lock_timeout_seconds,
                            next_step,
                        )
                        .await
                }
            };

            match outcome {
                Ok(applied) => {
                    self.ctx.add_events_applied(applied.len() as u64);
                    if let Some(event) = applied.last() {
                        self.ctx.advance_last_applied_coordinate(event.coordinates.clone()).await;
                    }
                    info!(drained = applied.len(), "cut-over complete");
                    if self.options.test_on_replica {
                        let old = old_table_name(&self.ctx.table, self.options.timestamp_old_table);
                        self.applier
                            .swap_back(&self.ctx.database, &self.ctx.table, &self.shadow_table, &old)
                            .await?;
                    }
                    return Ok(());
                }
                Err(e) if e.recovery_action() == crate::error::RecoveryAction::Retry && attempt < self.ctx.default_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "cut-over attempt failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Pops the next item from the event queue during the atomic cut-over's
/// lock-held drain. Returns `Apply` for a DML event, `Waiting` when the
/// queue is momentarily empty but the sentinel hasn't been seen yet, and
/// `Done` once the sentinel changelog row has been dequeued (everything
/// that preceded it in the binlog stream is therefore already applied,
/// the channel being FIFO in source order) or the streamer has hung up.
fn next_cut_over_drain_step(events_rx: &mut mpsc::Receiver<StreamItem>, sentinel_seen: &mut bool) -> CutOverDrainStep {
    loop {
        match events_rx.try_recv() {
            Ok(StreamItem::Dml(event)) => return CutOverDrainStep::Apply(Box::new(event)),
            Ok(StreamItem::Changelog(ChangelogSignal::CutOverSentinel { .. }, _)) => {
                *sentinel_seen = true;
            }
            Ok(StreamItem::Changelog(_, _)) => {}
            Err(mpsc::error::TryRecvError::Empty) => {
                return if *sentinel_seen { CutOverDrainStep::Done } else { CutOverDrainStep::Waiting };
            }
            Err(mpsc::error::TryRecvError::Disconnected) => return CutOverDrainStep::Done,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coordinates::BinlogCoordinates;
    use crate::model::BinlogDmlEvent;

    fn dml(pos: u64) -> StreamItem {
        StreamItem::Dml(BinlogDmlEvent::insert(
            "db",
            "orders",
            vec![mysql_common::Value::Int(1)],
            BinlogCoordinates::file("mysql-bin.000001", pos),
        ))
    }

    #[test]
    fn waits_while_queue_empty_and_sentinel_unseen() {
        let (_tx, mut rx) = mpsc::channel(8);
        let mut sentinel_seen = false;
        assert!(matches!(next_cut_over_drain_step(&mut rx, &mut sentinel_seen), CutOverDrainStep::Waiting));
    }

    #[test]
    fn applies_queued_dml_events_before_reporting_done() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(dml(100)).unwrap();
        tx.try_send(dml(200)).unwrap();
        tx.try_send(StreamItem::Changelog(ChangelogSignal::CutOverSentinel { value: "x".into() }, BinlogCoordinates::file("mysql-bin.000001", 300)))
            .unwrap();

        let mut sentinel_seen = false;
        assert!(matches!(next_cut_over_drain_step(&mut rx, &mut sentinel_seen), CutOverDrainStep::Apply(_)));
        assert!(matches!(next_cut_over_drain_step(&mut rx, &mut sentinel_seen), CutOverDrainStep::Apply(_)));
        // The sentinel itself carries no DML; once it's dequeued the drain is done.
        assert!(matches!(next_cut_over_drain_step(&mut rx, &mut sentinel_seen), CutOverDrainStep::Done));
        assert!(sentinel_seen);
    }

    #[test]
    fn disconnected_channel_reports_done() {
        let (tx, mut rx) = mpsc::channel::<StreamItem>(8);
        drop(tx);
        let mut sentinel_seen = false;
        assert!(matches!(next_cut_over_drain_step(&mut rx, &mut sentinel_seen), CutOverDrainStep::Done));
    }
}
