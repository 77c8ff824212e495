//! The real `ThrottleProbe` implementation `ghost-cli` wires in at
//! startup: a small manual HTTP GET (no new dependency — gh-ost's own
//! throttle-http check is just "did this URL return 200"), a control-replica
//! lag/query check over `mysql_async`, and a `key=threshold,...` load
//! parser against `SHOW GLOBAL STATUS`, the same shape gh-ost's own
//! `--max-load`/`--critical-load` flags take.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use tokio::sync::Mutex;

use ghost::context::ConnectionConfig;
use ghost::error::GhostError;
use ghost::throttler::ThrottleProbe;

pub struct DefaultThrottleProbe {
    control_replicas: Vec<Mutex<Conn>>,
}

impl DefaultThrottleProbe {
    pub async fn connect(control_replica_conns: &[ConnectionConfig]) -> Result<Self, GhostError> {
        let mut control_replicas = Vec::with_capacity(control_replica_conns.len());
        for conn in control_replica_conns {
            let opts: Opts = OptsBuilder::default()
                .ip_or_hostname(conn.host.clone())
                .tcp_port(conn.port)
                .user(Some(conn.user.clone()))
                .pass(Some(conn.password.clone()))
                .into();
            control_replicas.push(Mutex::new(Conn::new(opts).await?));
        }
        Ok(DefaultThrottleProbe { control_replicas })
    }
}

#[async_trait]
impl ThrottleProbe for DefaultThrottleProbe {
    async fn http_ok(&self, url: &str) -> Result<bool, GhostError> {
        let url = url.trim();
        let without_scheme = url.strip_prefix("http://").unwrap_or(url);
        let (host_port, path) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
        let (host, port) = host_port.split_once(':').unwrap_or((host_port, "80"));
        let port: u16 = port.parse().unwrap_or(80);

        let host = host.to_string();
        let path = format!("/{path}");
        tokio::task::spawn_blocking(move || -> Result<bool, GhostError> {
            let mut stream = TcpStream::connect((host.as_str(), port))?;
            stream.set_read_timeout(Some(Duration::from_secs(2)))?;
            let request = format!("GET {path} HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
            stream.write_all(request.as_bytes())?;
            let mut response = String::new();
            stream.read_to_string(&mut response)?;
            Ok(response.starts_with("HTTP/1.0 200") || response.starts_with("HTTP/1.1 200"))
        })
        .await
        .map_err(|e| GhostError::Transient(e.to_string()))?
    }

    async fn query_nonzero(&self, query: &str) -> Result<bool, GhostError> {
        let Some(lock) = self.control_replicas.first() else {
            return Ok(false);
        };
        let mut conn = lock.lock().await;
        let value: Option<i64> = conn.query_first(query).await?;
        Ok(value.unwrap_or(0) != 0)
    }

    async fn replica_lag_millis(&self) -> Result<u64, GhostError> {
        let mut max_lag = 0u64;
        for lock in &self.control_replicas {
            let mut conn = lock.lock().await;
            let row: Option<mysql_async::Row> = conn.query_first("SHOW SLAVE STATUS").await?;
            if let Some(row) = row {
                let seconds_behind: Option<u64> = row.get("Seconds_Behind_Master").flatten();
                max_lag = max_lag.max(seconds_behind.unwrap_or(0) * 1000);
            }
        }
        Ok(max_lag)
    }

    async fn load_exceeds(&self, thresholds: &str) -> Result<bool, GhostError> {
        let Some(lock) = self.control_replicas.first() else {
            return Ok(false);
        };
        let mut conn = lock.lock().await;
        for clause in thresholds.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let Some((key, threshold)) = clause.split_once('=') else {
                continue;
            };
            let threshold: f64 = threshold.trim().parse().unwrap_or(f64::MAX);
            let row: Option<(String, String)> = conn
                .exec_first("SHOW GLOBAL STATUS LIKE ?", (key.trim(),))
                .await?;
            if let Some((_, value)) = row {
                if value.parse::<f64>().unwrap_or(0.0) > threshold {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
