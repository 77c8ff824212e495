//! The interactive control channel: a line protocol served over a Unix
//! socket (and optionally a TCP port), letting an operator inspect and
//! tune a running migration without restarting it.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, instrument, warn};

use crate::context::MigrationContext;
use crate::error::GhostError;
use crate::hooks::{base_env, HookPoint, Hooks};

pub struct ControlServer {
    ctx: Arc<MigrationContext>,
    hooks: Arc<Hooks>,
    socket_path: Option<PathBuf>,
    tcp_port: Option<u16>,
}

impl ControlServer {
    pub fn new(ctx: Arc<MigrationContext>, hooks: Arc<Hooks>, socket_path: Option<PathBuf>, tcp_port: Option<u16>) -> Self {
        ControlServer { ctx, hooks, socket_path, tcp_port }
    }

    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<(), GhostError> {
        let unix = match &self.socket_path {
            Some(path) => {
                let _ = std::fs::remove_file(path);
                Some(UnixListener::bind(path)?)
            }
            None => None,
        };
        let tcp = match self.tcp_port {
            Some(port) => Some(TcpListener::bind(("127.0.0.1", port)).await?),
            None => None,
        };

        let mut shutdown_rx = self.ctx.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = accept_unix(unix.as_ref()) => {
                    if let Some(Ok((stream, _))) = accepted {
                        let ctx = self.ctx.clone();
                        let hooks = self.hooks.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_line_protocol(stream, ctx, hooks).await {
                                warn!(error = %e, "control connection ended with error");
                            }
                        });
                    }
                }
                accepted = accept_tcp(tcp.as_ref()) => {
                    if let Some(Ok((stream, _))) = accepted {
                        let ctx = self.ctx.clone();
                        let hooks = self.hooks.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_line_protocol(stream, ctx, hooks).await {
                                warn!(error = %e, "control connection ended with error");
                            }
                        });
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("control server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> Option<std::io::Result<(tokio::net::UnixStream, tokio::net::unix::SocketAddr)>> {
    match listener {
        Some(l) => Some(l.accept().await),
        None => std::future::pending().await,
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> Option<std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)>> {
    match listener {
        Some(l) => Some(l.accept().await),
        None => std::future::pending().await,
    }
}

async fn serve_line_protocol<S>(stream: S, ctx: Arc<MigrationContext>, hooks: Arc<Hooks>) -> Result<(), GhostError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let response = handle_command(&ctx, line).await;

        // onStatus fires for the `status` verb specifically; every other
        // recognized or unrecognized command fires onInteractiveCommand
        // (§6). Hook failures here are observational, never fatal.
        let mut env = base_env(&ctx.database, &ctx.table, &ctx.alter, ctx.rows_copied());
        env.insert("GHOST_COMMAND".to_string(), line.to_string());
        let point = if line == "status" { HookPoint::OnStatus } else { HookPoint::OnInteractiveCommand };
        if let Err(e) = hooks.invoke(point, &env).await {
            warn!(error = %e, "control-channel hook failed");
        }

        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

/// Executes one verb of the line protocol, returning the text response.
pub async fn handle_command(ctx: &Arc<MigrationContext>, line: &str) -> String {
    if line == "status" {
        return format_status(ctx).await;
    }
    if line == "sup" {
        return "OK".to_string();
    }
    if line == "throttle" {
        ctx.update_tunables(|_| {}).await;
        ctx.publish_throttle(true, "commanded via control channel".to_string());
        return "OK".to_string();
    }
    if line == "no-throttle" {
        ctx.publish_throttle(false, String::new());
        return "OK".to_string();
    }
    if line == "unpostpone" {
        // Handled by the migrator via a flag-file check; the control
        // channel only acknowledges the request here.
        return "OK".to_string();
    }
    if line == "panic" {
        ctx.set_panicked();
        ctx.request_shutdown();
        return "OK".to_string();
    }
    if let Some(value) = line.strip_prefix("chunk-size=") {
        return apply_u32(ctx, value, |t, v| t.chunk_size = v).await;
    }
    if let Some(value) = line.strip_prefix("dml-batch-size=") {
        return apply_u32(ctx, value, |t, v| t.dml_batch_size = v).await;
    }
    if let Some(value) = line.strip_prefix("max-lag-millis=") {
        return apply_u64(ctx, value, |t, v| t.max_lag_millis = v).await;
    }
    if let Some(value) = line.strip_prefix("nice-ratio=") {
        return apply_f64(ctx, value, |t, v| t.nice_ratio = v).await;
    }
    if let Some(value) = line.strip_prefix("max-load=") {
        ctx.update_tunables(|t| t.max_load = Some(value.to_string())).await;
        return "OK".to_string();
    }
    if let Some(value) = line.strip_prefix("critical-load=") {
        ctx.update_tunables(|t| t.critical_load = Some(value.to_string())).await;
        return "OK".to_string();
    }
    format!("ERROR unknown command: {line}")
}

async fn apply_u32(ctx: &Arc<MigrationContext>, value: &str, f: impl FnOnce(&mut crate::context::TunableParams, u32)) -> String {
    match value.parse::<u32>() {
        Ok(v) => {
            ctx.update_tunables(|t| f(t, v)).await;
            "OK".to_string()
        }
        Err(_) => format!("ERROR invalid integer: {value}"),
    }
}

async fn apply_u64(ctx: &Arc<MigrationContext>, value: &str, f: impl FnOnce(&mut crate::context::TunableParams, u64)) -> String {
    match value.parse::<u64>() {
        Ok(v) => {
            ctx.update_tunables(|t| f(t, v)).await;
            "OK".to_string()
        }
        Err(_) => format!("ERROR invalid integer: {value}"),
    }
}

async fn apply_f64(ctx: &Arc<MigrationContext>, value: &str, f: impl FnOnce(&mut crate::context::TunableParams, f64)) -> String {
    match value.parse::<f64>() {
        Ok(v) => {
            ctx.update_tunables(|t| f(t, v)).await;
            "OK".to_string()
        }
        Err(_) => format!("ERROR invalid float: {value}"),
    }
}

async fn format_status(ctx: &Arc<MigrationContext>) -> String {
    let phase = ctx.phase().await;
    let (throttled, reason) = ctx.throttle_decision();
    format!(
        "phase={:?} rows_copied={} events_applied={} lag_ms={} throttled={} reason={}",
        phase,
        ctx.rows_copied(),
        ctx.events_applied(),
        ctx.lag_millis(),
        throttled,
        reason
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ConnectionConfig;

    fn test_ctx() -> Arc<MigrationContext> {
        MigrationContext::new(
            ConnectionConfig { host: "h".into(), port: 3306, user: "u".into(), password: "p".into() },
            ConnectionConfig { host: "h".into(), port: 3306, user: "u".into(), password: "p".into() },
            "db".into(),
            "t".into(),
            "ADD COLUMN b INT".into(),
        )
    }

    #[tokio::test]
    async fn chunk_size_updates_tunables() {
        let ctx = test_ctx();
        let resp = handle_command(&ctx, "chunk-size=250").await;
        assert_eq!(resp, "OK");
        assert_eq!(ctx.tunables().await.chunk_size, 250);
    }

    #[tokio::test]
    async fn status_reports_phase() {
        let ctx = test_ctx();
        let resp = handle_command(&ctx, "status").await;
        assert!(resp.contains("phase=Setup"));
    }

    #[tokio::test]
    async fn unknown_command_errors() {
        let ctx = test_ctx();
        let resp = handle_command(&ctx, "frobnicate").await;
        assert!(resp.starts_with("ERROR"));
    }
}
