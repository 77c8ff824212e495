//! Mirrors the teacher's `binlog_cli::cli_options::CliOptions`: a small
//! struct carrying the process-wide flags that sit outside the migration
//! itself (debug/print-logs/output format), built from the parsed
//! `CliArgs` and threaded into whatever needs them without re-parsing.

use serde::Serialize;

use common::config::load_style::Format;

#[derive(Debug, Clone, Serialize)]
pub struct CliOptions {
    debug: bool,
    print_logs: bool,
    format: Format,
}

impl CliOptions {
    pub fn new(debug: bool, format: Format) -> Self {
        CliOptions { debug, print_logs: false, format }
    }

    pub fn new_with_log(debug: bool, format: Format) -> Self {
        CliOptions { debug, print_logs: true, format }
    }

    pub fn is_print_logs(&self) -> bool {
        self.print_logs
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn get_format(&self) -> Format {
        self.format
    }
}

impl Default for CliOptions {
    fn default() -> Self {
        CliOptions::new(false, Format::None)
    }
}
