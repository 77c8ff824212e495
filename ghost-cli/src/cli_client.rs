//! Wires the parsed CLI arguments to the `ghost` library: runs the
//! `setup` phase (inspect, create shadow/changelog, detect renames),
//! then — for a real (`--execute`) run — starts the streamer, throttler
//! and control-channel background tasks and drives the `Migrator` to
//! completion. A dry run stops after `setup` and prints the plan,
//! mirroring the teacher's own `CliClient` (`binlog_cli::cli_client`)
//! shape: a struct built from parsed args that owns the one `start`
//! entry point.

use std::sync::Arc;
use std::time::Duration;

use mysql_async::{Conn, OptsBuilder};
use tokio::sync::mpsc;
use tracing::info;

use ghost::applier::{Applier, CutOverStyle};
use ghost::config::GhostConfig;
use ghost::context::{ConnectionConfig, MigrationContext, TunableParams};
use ghost::control::ControlServer;
use ghost::error::GhostError;
use ghost::hooks::Hooks;
use ghost::inspector::{InspectionOptions, Inspector};
use ghost::migrator::{Migrator, MigratorOptions};
use ghost::model::{detect_renamed_columns, ColumnDescriptor, ColumnList};
use ghost::streamer::Streamer;
use ghost::throttler::{Throttler, ThrottlerFlagFiles};

use crate::cli_options::CliOptions;
use crate::throttle_probe::DefaultThrottleProbe;
use crate::{CliArgs, CutOverArg};

pub struct CliClient {
    cli_options: CliOptions,
    args: CliArgs,
    file_config: GhostConfig,
}

impl CliClient {
    pub fn new(cli_options: CliOptions, args: CliArgs, file_config: GhostConfig) -> Self {
        CliClient { cli_options, args, file_config }
    }

    pub async fn run(self) -> Result<(), GhostError> {
        let args = &self.args;
        let conn = self.resolve_connection();
        let tunables = self.build_tunables();

        let ctx = MigrationContext::new_with_options(
            conn.clone(),
            conn.clone(),
            args.database.clone(),
            args.table.clone(),
            args.alter.clone(),
            args.default_retries,
            args.cut_over_lock_timeout_seconds,
            100,
            args.replica_server_id,
            tunables,
        );

        let mut inspector = Inspector::connect(&ctx.inspector_conn).await?;
        let inspection_opts = InspectionOptions {
            assume_master_host: args.assume_master_host.clone(),
            allow_on_master: args.allow_on_master,
            allow_master_master: args.allow_master_master,
            assume_rbr: args.assume_rbr,
            switch_to_rbr: args.switch_to_rbr,
            allow_nullable_unique_key: args.allow_nullable_unique_key,
            exact_rowcount: args.exact_rowcount,
            discard_foreign_keys: args.discard_foreign_keys,
            skip_foreign_key_checks: args.skip_foreign_key_checks,
        };
        inspector.validate_topology(&ctx.inspector_conn.host, &inspection_opts).await?;
        inspector
            .validate_foreign_keys_and_triggers(&args.database, &args.table, &inspection_opts)
            .await?;

        let original_columns = inspector.discover_columns(&args.database, &args.table).await?;
        let candidate_keys = inspector.discover_unique_keys(&args.database, &args.table).await?;
        let shared_key = inspector.select_key(&candidate_keys, args.allow_nullable_unique_key).await?;

        // `--concurrent-rowcount`: an exact COUNT(*) can take as long as the
        // copy itself on a large table, so don't make setup wait on it —
        // use the fast EXPLAIN estimate up front and let the exact count
        // finish in the background (gh-ost's own behavior for this flag).
        let estimated_rows = if args.exact_rowcount && args.concurrent_rowcount {
            let fast_estimate = inspector.estimate_row_count(&args.database, &args.table, false).await?;
            let mut background_inspector = Inspector::connect(&ctx.inspector_conn).await?;
            let (db, table) = (args.database.clone(), args.table.clone());
            tokio::spawn(async move {
                match background_inspector.estimate_row_count(&db, &table, true).await {
                    Ok(exact) => info!(exact, "concurrent row count complete"),
                    Err(e) => tracing::warn!(error = %e, "concurrent row count failed"),
                }
            });
            fast_estimate
        } else {
            inspector.estimate_row_count(&args.database, &args.table, args.exact_rowcount).await?
        };
        let start_coordinates = inspector.current_binlog_coordinates().await?;

        ctx.set_original_columns(original_columns.clone()).await;
        ctx.set_shared_key(shared_key.clone()).await;

        let renames = detect_renamed_columns(&args.alter);
        if !renames.is_empty() && !args.approve_renamed_columns && !args.skip_renamed_columns {
            return Err(GhostError::RenameAmbiguity(format!(
                "detected column rename(s) {renames:?}; pass --approve-renamed-columns to carry data across them \
                 or --skip-renamed-columns to proceed without"
            )));
        }
        let rename_map = if args.approve_renamed_columns { renames } else { Vec::new() };

        info!(
            database = %args.database,
            table = %args.table,
            shared_key = %shared_key.name,
            estimated_rows,
            start_coordinates = %start_coordinates,
            "setup complete"
        );

        if !args.execute {
            println!(
                "DRY RUN: would alter `{}`.`{}` ({} estimated rows) via shared key `{}`; pass --execute to run for real",
                args.database, args.table, estimated_rows, shared_key.name
            );
            return Ok(());
        }

        let mut applier = Applier::connect(&ctx.applier_conn, &args.database).await?;
        let shadow_table = applier
            .create_shadow_table(&args.database, &args.table, &args.alter, args.initially_drop_ghost_table)
            .await?;
        applier
            .create_changelog_table(&args.database, &args.table, args.initially_drop_ghost_table)
            .await?;
        if args.initially_drop_old_table {
            let old = ghost::model::old_table_name(&args.table, args.timestamp_old_table);
            applier.drop_table(&args.database, &old).await?;
        }

        let mut shadow_inspector = Inspector::connect(&ctx.applier_conn).await?;
        let shadow_columns = shadow_inspector.discover_columns(&args.database, &shadow_table).await?;
        ctx.set_shadow_columns(shadow_columns.clone()).await;

        let (original_shared_columns, shared_columns) = build_shared_columns(&original_columns, &shadow_columns, &rename_map);
        let key_columns = shared_key.columns.clone();

        let (events_tx, events_rx) = mpsc::channel(16 * ctx.tunables().await.dml_batch_size as usize);

        let streamer_conn = self.connect_replication(&ctx.applier_conn).await?;
        let streamer = Streamer::connect(
            streamer_conn,
            ctx.replica_server_id,
            args.database.clone(),
            args.table.clone(),
            ghost::model::changelog_table_name(&args.table),
        )
        .await;
        let streamer_ctx = ctx.clone();
        let streamer_handle = tokio::spawn(async move { streamer.run(start_coordinates, events_tx, streamer_ctx).await });

        let control_replicas = self.control_replica_configs(&conn);
        let probe = Arc::new(DefaultThrottleProbe::connect(&control_replicas).await?);
        let throttler = Arc::new(Throttler::new(
            ctx.clone(),
            probe,
            self.throttler_flags(),
            Duration::from_millis(args.critical_load_interval_millis),
        ));
        let throttler_handle = tokio::spawn(throttler.run());

        let hooks = Arc::new(Hooks::new(args.hooks_path.clone(), args.hooks_hint.clone()));

        let control_handle = if args.serve_socket_file.is_some() || args.serve_tcp_port.is_some() {
            if args.initially_drop_socket_file {
                if let Some(path) = &args.serve_socket_file {
                    let _ = std::fs::remove_file(path);
                }
            }
            let server = Arc::new(ControlServer::new(ctx.clone(), hooks.clone(), args.serve_socket_file.clone(), args.serve_tcp_port));
            Some(tokio::spawn(server.run()))
        } else {
            None
        };

        // Ctrl-C / SIGTERM requests a normal shutdown: in-flight transactions
        // finish or roll back, the phase is recorded (§5 "Cancellation").
        let signal_ctx = ctx.clone();
        let signal_handle = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
                signal_ctx.request_shutdown();
            }
        });

        let options = MigratorOptions {
            cut_over: match args.cut_over {
                CutOverArg::Atomic => CutOverStyle::Atomic,
                CutOverArg::TwoStep => CutOverStyle::TwoStep,
            },
            ok_to_drop_table: args.ok_to_drop_table,
            timestamp_old_table: args.timestamp_old_table,
            test_on_replica: args.test_on_replica || args.migrate_on_replica,
            postpone_cut_over_flag_file: args.postpone_cut_over_flag_file.clone(),
        };
        let migrator = Migrator::new(
            ctx.clone(),
            applier,
            hooks,
            options,
            events_rx,
            shadow_table,
            key_columns,
            original_shared_columns,
            shared_columns,
        );

        let result = migrator.run().await;

        ctx.request_shutdown();
        signal_handle.abort();
        let _ = streamer_handle.await;
        let _ = throttler_handle.await;
        if let Some(handle) = control_handle {
            handle.abort();
        }

        if self.cli_options.is_print_logs() {
            println!("final status: phase={:?}", ctx.phase().await);
        }
        result
    }

    fn resolve_connection(&self) -> ConnectionConfig {
        if let Some(alias) = self.file_config.resolve_alias(&self.args.host) {
            return ConnectionConfig {
                host: alias.host.clone(),
                port: alias.port,
                user: self.args.user.clone(),
                password: self.args.password.clone(),
            };
        }
        ConnectionConfig {
            host: self.args.host.clone(),
            port: self.args.port,
            user: self.args.user.clone(),
            password: self.args.password.clone(),
        }
    }

    fn build_tunables(&self) -> TunableParams {
        let mut tunables = TunableParams::default();
        if let Some(v) = self.file_config.chunk_size {
            tunables.chunk_size = v;
        }
        if let Some(v) = self.file_config.dml_batch_size {
            tunables.dml_batch_size = v;
        }
        if let Some(v) = self.file_config.max_lag_millis {
            tunables.max_lag_millis = v;
        }
        if let Some(v) = self.file_config.nice_ratio {
            tunables.nice_ratio = v;
        }
        tunables.max_load = self.file_config.max_load.clone();
        tunables.critical_load = self.file_config.critical_load.clone();

        // Explicit CLI flags always override the config file (§6).
        if let Some(v) = self.args.chunk_size {
            tunables.chunk_size = v;
        }
        if let Some(v) = self.args.dml_batch_size {
            tunables.dml_batch_size = v;
        }
        if let Some(v) = self.args.max_lag_millis {
            tunables.max_lag_millis = v;
        }
        if let Some(v) = self.args.nice_ratio {
            tunables.nice_ratio = v;
        }
        if let Some(v) = &self.args.max_load {
            tunables.max_load = Some(v.clone());
        }
        if let Some(v) = &self.args.critical_load {
            tunables.critical_load = Some(v.clone());
        }
        tunables.throttle_query = self.args.throttle_query.clone();
        tunables.throttle_http = self.args.throttle_http.clone();
        tunables
    }

    fn throttler_flags(&self) -> ThrottlerFlagFiles {
        ThrottlerFlagFiles {
            panic_flag_file: self.args.panic_flag_file.clone(),
            throttle_flag_file: self.args.throttle_flag_file.clone(),
            additional_flag_file: self.args.throttle_additional_flag_file.clone(),
            postpone_cut_over_flag_file: self.args.postpone_cut_over_flag_file.clone(),
        }
    }

    /// `--throttle-control-replicas host:port,host:port`, falling back to
    /// the target host itself so lag/load checks always have somewhere
    /// to query (§4.5, §6).
    fn control_replica_configs(&self, fallback: &ConnectionConfig) -> Vec<ConnectionConfig> {
        match &self.args.throttle_control_replicas {
            Some(list) if !list.trim().is_empty() => list
                .split(',')
                .filter_map(|entry| {
                    let entry = entry.trim();
                    let (host, port) = entry.split_once(':')?;
                    Some(ConnectionConfig {
                        host: host.to_string(),
                        port: port.parse().ok()?,
                        user: fallback.user.clone(),
                        password: fallback.password.clone(),
                    })
                })
                .collect(),
            _ => vec![fallback.clone()],
        }
    }

    async fn connect_replication(&self, conn: &ConnectionConfig) -> Result<Conn, GhostError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(conn.host.clone())
            .tcp_port(conn.port)
            .user(Some(conn.user.clone()))
            .pass(Some(conn.password.clone()));
        Ok(Conn::new(opts).await?)
    }
}

/// Returns the original-side names of the shared columns (for the copy
/// `SELECT`) alongside the shadow-side descriptors (for the shadow `INSERT`
/// and for DML replay), in the same order, so a renamed column's two names
/// never get conflated into one list (§4.3 "Column mapping").
fn build_shared_columns(original: &ColumnList, shadow: &ColumnList, rename_map: &[(String, String)]) -> (Vec<String>, ColumnList) {
    let pairs = original.shared_pairs_with(shadow, rename_map);
    let original_names = pairs.iter().map(|(orig, _)| orig.clone()).collect();
    let descriptors: Vec<ColumnDescriptor> = pairs
        .iter()
        .filter_map(|(_, shadow_name)| shadow.columns().iter().find(|c| &c.name == shadow_name).cloned())
        .collect();
    (original_names, ColumnList::new(descriptors))
}
