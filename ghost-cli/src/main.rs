mod cli_client;
mod cli_options;
mod throttle_probe;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use common::config::load_style::Format;
use common::log::tracing_factory::{OutputType, TracingFactory, TracingFactoryOptions};
use common::pretty_util::to_string_pretty;

use cli_client::CliClient;
use cli_options::CliOptions;
use ghost::config::GhostConfig;

/// Online, non-blocking `ALTER TABLE` for a MySQL-protocol server: builds
/// a shadow copy of the target table, replays concurrent writes from the
/// binlog, and cuts over atomically.
#[derive(Parser, Serialize, Debug, Clone)]
#[command(name = "ghost-cli")]
#[command(version = "0.0.2")]
#[command(author = "rust-us")]
#[command(about = "Online schema-change engine for MySQL-protocol servers")]
#[command(long_about = None)]
pub(crate) struct CliArgs {
    /// Path to an optional TOML config file resolving host aliases and
    /// load/chunk defaults; explicit flags below always win (§6).
    #[arg(short, long, help = "Path to an optional TOML config file", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "enable debug mode", default_value_t = false)]
    pub debug: bool,

    #[arg(short, long, help = "output format: [yaml | json], default yaml", default_value = "yaml")]
    pub format: String,

    ///////////////////////////////////////////////////
    // Required //
    ///////////////////////////////////////////////////
    #[arg(long, help = "schema name of the table to alter", required = true)]
    pub database: String,

    #[arg(long, help = "name of the table to alter", required = true)]
    pub table: String,

    #[arg(long, help = "body of the ALTER TABLE statement, without ALTER TABLE <name>", required = true)]
    pub alter: String,

    /// Real runs require `--execute`; otherwise the engine validates
    /// topology, prints its plan, and exits without touching data (§6).
    #[arg(long, help = "perform the migration for real; omit for a dry run", default_value_t = false)]
    pub execute: bool,

    ///////////////////////////////////////////////////
    // Connection //
    ///////////////////////////////////////////////////
    #[arg(long, help = "mysql host", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, help = "mysql port", default_value_t = 3306)]
    pub port: u16,

    #[arg(short, long, help = "mysql username", default_value = "root")]
    pub user: String,

    #[arg(short, long, help = "mysql password", default_value = "")]
    pub password: String,

    ///////////////////////////////////////////////////
    // Topology //
    ///////////////////////////////////////////////////
    #[arg(long, help = "treat this host as though its master were the given host:port")]
    pub assume_master_host: Option<String>,

    #[arg(long, help = "allow running directly against a master", default_value_t = false)]
    pub allow_on_master: bool,

    #[arg(long, help = "allow a master-master topology", default_value_t = false)]
    pub allow_master_master: bool,

    #[arg(long, help = "validate the migration on a replica, then swap back", default_value_t = false)]
    pub test_on_replica: bool,

    #[arg(long, help = "assume an external plugin has already stopped replication", default_value_t = false)]
    pub test_on_replica_skip_replica_stop: bool,

    #[arg(long, help = "migrate directly on a replica, then swap back", default_value_t = false)]
    pub migrate_on_replica: bool,

    #[arg(long, help = "switch binlog_format to ROW on the inspected replica", default_value_t = false)]
    pub switch_to_rbr: bool,

    #[arg(long, help = "trust that binlog_format is already ROW without checking", default_value_t = false)]
    pub assume_rbr: bool,

    #[arg(long, help = "allow selecting a unique key that has nullable columns", default_value_t = false)]
    pub allow_nullable_unique_key: bool,

    #[arg(
        long,
        help = "DANGER! migrate a table that has foreign keys, without recreating them on the shadow table",
        default_value_t = false
    )]
    pub discard_foreign_keys: bool,

    #[arg(long, help = "trust there are no foreign keys and skip the check", default_value_t = false)]
    pub skip_foreign_key_checks: bool,

    ///////////////////////////////////////////////////
    // Row count //
    ///////////////////////////////////////////////////
    #[arg(long, help = "COUNT(*) the table exactly instead of using the EXPLAIN estimate", default_value_t = false)]
    pub exact_rowcount: bool,

    #[arg(long, help = "run the row count concurrently with row-copy", default_value_t = false)]
    pub concurrent_rowcount: bool,

    ///////////////////////////////////////////////////
    // Rename approval //
    ///////////////////////////////////////////////////
    #[arg(long, help = "approve detected column renames and migrate the data across them", default_value_t = false)]
    pub approve_renamed_columns: bool,

    #[arg(long, help = "proceed without carrying data across detected column renames", default_value_t = false)]
    pub skip_renamed_columns: bool,

    ///////////////////////////////////////////////////
    // Throughput / throttling //
    ///////////////////////////////////////////////////
    #[arg(long, help = "rows per row-copy chunk [100-100000]")]
    pub chunk_size: Option<u32>,

    #[arg(long, help = "events per DML-replay batch [1-100]")]
    pub dml_batch_size: Option<u32>,

    #[arg(long, help = "maximum tolerated replication lag, in milliseconds")]
    pub max_lag_millis: Option<u64>,

    #[arg(long, help = "fraction of chunk-copy time to additionally sleep between chunks [0.0-100.0]")]
    pub nice_ratio: Option<f64>,

    #[arg(long, help = "retries for transient errors before giving up", default_value_t = 60)]
    pub default_retries: u32,

    #[arg(long, help = "seconds the cut-over WRITE LOCK may be held before retrying", default_value_t = 3)]
    pub cut_over_lock_timeout_seconds: u32,

    #[arg(long, help = "key=threshold,... SHOW GLOBAL STATUS thresholds that throttle")]
    pub max_load: Option<String>,

    #[arg(long, help = "key=threshold,... SHOW GLOBAL STATUS thresholds that abort the migration")]
    pub critical_load: Option<String>,

    #[arg(long, help = "milliseconds to wait and re-check before treating critical load as fatal", default_value_t = 0)]
    pub critical_load_interval_millis: u64,

    #[arg(long, help = "host:port of replicas to check lag/load on, comma-separated")]
    pub throttle_control_replicas: Option<String>,

    #[arg(long, help = "a query against a control replica; non-zero result throttles")]
    pub throttle_query: Option<String>,

    #[arg(long, help = "a URL; any non-200 response throttles")]
    pub throttle_http: Option<String>,

    #[arg(long, help = "path to a flag file whose presence throttles")]
    pub throttle_flag_file: Option<PathBuf>,

    #[arg(long, help = "path to a second flag file whose presence also throttles")]
    pub throttle_additional_flag_file: Option<PathBuf>,

    #[arg(long, help = "path to a flag file whose presence postpones cut-over")]
    pub postpone_cut_over_flag_file: Option<PathBuf>,

    #[arg(long, help = "path to a flag file whose presence aborts the migration immediately")]
    pub panic_flag_file: Option<PathBuf>,

    ///////////////////////////////////////////////////
    // Cut-over //
    ///////////////////////////////////////////////////
    #[arg(long, value_enum, help = "cut-over style", default_value = "atomic")]
    pub cut_over: CutOverArg,

    ///////////////////////////////////////////////////
    // Cleanup //
    ///////////////////////////////////////////////////
    #[arg(long, help = "drop the old table once the migration completes", default_value_t = false)]
    pub ok_to_drop_table: bool,

    #[arg(long, help = "suffix the old table name with a timestamp", default_value_t = false)]
    pub timestamp_old_table: bool,

    #[arg(long, help = "drop a pre-existing old table instead of failing", default_value_t = false)]
    pub initially_drop_old_table: bool,

    #[arg(long, help = "drop a pre-existing shadow table instead of failing", default_value_t = false)]
    pub initially_drop_ghost_table: bool,

    #[arg(long, help = "remove a pre-existing control socket file instead of failing", default_value_t = false)]
    pub initially_drop_socket_file: bool,

    ///////////////////////////////////////////////////
    // Hooks //
    ///////////////////////////////////////////////////
    #[arg(long, help = "directory of phase-boundary hook scripts")]
    pub hooks_path: Option<PathBuf>,

    #[arg(long, help = "opaque hint exported to hooks as GHOST_HOOKS_HINT")]
    pub hooks_hint: Option<String>,

    ///////////////////////////////////////////////////
    // Replication registration //
    ///////////////////////////////////////////////////
    #[arg(long, help = "unique server-id to register as when subscribing to the binlog stream", default_value_t = 99999)]
    pub replica_server_id: u32,

    ///////////////////////////////////////////////////
    // Control channel //
    ///////////////////////////////////////////////////
    #[arg(long, help = "Unix socket path to serve the interactive control channel on")]
    pub serve_socket_file: Option<PathBuf>,

    #[arg(long, help = "TCP port to serve the interactive control channel on")]
    pub serve_tcp_port: Option<u16>,
}

#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CutOverArg {
    Atomic,
    TwoStep,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let format = Format::format(&args.format);
    eprintln!("args: \n{} ", to_string_pretty(&format, &args));

    let file_config = load_config(&args);
    if args.debug {
        eprintln!("loaded config file: \n{}", to_string_pretty(&format, &file_config));
    }

    let log_opt = TracingFactoryOptions::new(args.debug, OutputType::STDOUT, None);
    let log_factory = TracingFactory::init_log_with_options(log_opt);
    eprintln!("log_dir: {:?}", log_factory.get_log_dir());

    eprintln!();
    eprintln!("╔╗╔╦═╗╔═╗╔═╗╔╦╗  ╔═╗╦  ╦");
    eprintln!("║╚╝║╠═╣║ ║╚═╗ ║───║  ║  ║");
    eprintln!("╚╝╚╝╩ ╩╚═╝╚═╝ ╩   ╚═╝╩═╝╩  MySQL online schema-change engine");
    eprintln!();

    let client = CliClient::new(CliOptions::new_with_log(args.debug, format), args.clone(), file_config);
    let code = match client.run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("migration failed: {e}");
            1
        }
    };
    std::process::exit(code);
}

fn load_config(args: &CliArgs) -> GhostConfig {
    match &args.config {
        Some(path) => GhostConfig::load(path).unwrap_or_else(|e| {
            eprintln!("failed to load config file {path:?}: {e}; continuing with defaults");
            GhostConfig::default()
        }),
        None => GhostConfig::default(),
    }
}
