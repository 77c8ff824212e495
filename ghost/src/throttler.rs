//! Continuous evaluator of lag/load/flag-file/HTTP/query throttle
//! sources. Publishes a single atomic `(throttled, reason)` decision that
//! row-copy and DML-replay must honor before starting any transaction
//! (§4.5). Runs on a sub-second interval, per spec.md.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::context::MigrationContext;
use crate::error::GhostError;

/// External checks the throttler can't perform with stdlib alone
/// (arbitrary HTTP endpoint, arbitrary SQL query against a control
/// replica). Kept as a trait so the evaluator's priority/gating logic is
/// fully testable without a live server or network; `ghost-cli` wires a
/// real implementation at startup.
#[async_trait]
pub trait ThrottleProbe: Send + Sync {
    async fn http_ok(&self, url: &str) -> Result<bool, GhostError>;
    async fn query_nonzero(&self, query: &str) -> Result<bool, GhostError>;
    async fn replica_lag_millis(&self) -> Result<u64, GhostError>;
    async fn load_exceeds(&self, thresholds: &str) -> Result<bool, GhostError>;
}

#[derive(Debug, Clone, Default)]
pub struct ThrottlerFlagFiles {
    pub panic_flag_file: Option<PathBuf>,
    pub throttle_flag_file: Option<PathBuf>,
    pub additional_flag_file: Option<PathBuf>,
    pub postpone_cut_over_flag_file: Option<PathBuf>,
}

pub struct Throttler {
    ctx: Arc<MigrationContext>,
    probe: Arc<dyn ThrottleProbe>,
    flags: ThrottlerFlagFiles,
    critical_load_interval: Duration,
    evaluation_interval: Duration,
}

impl Throttler {
    pub fn new(
        ctx: Arc<MigrationContext>,
        probe: Arc<dyn ThrottleProbe>,
        flags: ThrottlerFlagFiles,
        critical_load_interval: Duration,
    ) -> Self {
        Throttler {
            ctx,
            probe,
            flags,
            critical_load_interval,
            evaluation_interval: Duration::from_millis(500),
        }
    }

    pub fn postpone_cut_over(&self) -> bool {
        self.flags
            .postpone_cut_over_flag_file
            .as_ref()
            .is_some_and(|p| p.exists())
    }

    /// One evaluation pass, in priority order. Returns `Err` for the two
    /// fatal conditions (panic flag, critical load); otherwise publishes
    /// the throttle decision into the context and returns `Ok(())`.
    #[instrument(skip(self))]
    pub async fn evaluate_once(&self) -> Result<(), GhostError> {
        if self.flags.panic_flag_file.as_ref().is_some_and(|p| p.exists()) {
            return Err(GhostError::PanicFlag("panic flag file present".to_string()));
        }

        let tunables = self.ctx.tunables().await;
        if let Some(critical) = tunables.critical_load.as_deref() {
            if self.probe.load_exceeds(critical).await? {
                // Optional re-check after critical_load_interval before declaring fatal.
                if !self.critical_load_interval.is_zero() {
                    tokio::time::sleep(self.critical_load_interval).await;
                    if !self.probe.load_exceeds(critical).await? {
                        // transient spike, fall through to the normal checks
                    } else {
                        return Err(GhostError::FatalCritical(format!("critical load exceeded: {critical}")));
                    }
                } else {
                    return Err(GhostError::FatalCritical(format!("critical load exceeded: {critical}")));
                }
            }
        }

        if let Some((throttled, reason)) = self.check_throttle_sources(&tunables).await? {
            self.ctx.publish_throttle(true, reason);
        } else {
            self.ctx.publish_throttle(false, String::new());
        }
        Ok(())
    }

    async fn check_throttle_sources(
        &self,
        tunables: &crate::context::TunableParams,
    ) -> Result<Option<(bool, String)>, GhostError> {
        if self.flags.throttle_flag_file.as_ref().is_some_and(|p| p.exists()) {
            return Ok(Some((true, "throttle flag file present".to_string())));
        }
        if self.flags.additional_flag_file.as_ref().is_some_and(|p| p.exists()) {
            return Ok(Some((true, "additional flag file present".to_string())));
        }
        if let Some(url) = tunables.throttle_http.as_deref() {
            if !self.probe.http_ok(url).await? {
                return Ok(Some((true, format!("throttle-http {url} did not return 200"))));
            }
        }
        if let Some(query) = tunables.throttle_query.as_deref() {
            if self.probe.query_nonzero(query).await? {
                return Ok(Some((true, "throttle-query returned non-zero".to_string())));
            }
        }
        let lag = self.probe.replica_lag_millis().await?;
        self.ctx.set_lag_millis(lag);
        if lag > tunables.max_lag_millis {
            return Ok(Some((true, format!("replication lag {lag}ms exceeds max-lag-millis {}", tunables.max_lag_millis))));
        }
        if let Some(max_load) = tunables.max_load.as_deref() {
            if self.probe.load_exceeds(max_load).await? {
                return Ok(Some((true, format!("max load exceeded: {max_load}"))));
            }
        }
        Ok(None)
    }

    /// Runs the evaluator forever on `evaluation_interval`, until shutdown
    /// is requested. Fatal conditions request shutdown and exit the loop;
    /// the orchestrator is expected to also be watching for them via
    /// `ctx.is_panicked()`/phase transitions.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.ctx.subscribe_shutdown();
        let mut ticker = tokio::time::interval(self.evaluation_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.evaluate_once().await {
                        Ok(()) => {}
                        Err(GhostError::PanicFlag(reason)) => {
                            warn!(reason, "throttler observed panic flag");
                            self.ctx.set_panicked();
                            self.ctx.request_shutdown();
                            return;
                        }
                        Err(GhostError::FatalCritical(reason)) => {
                            warn!(reason, "throttler observed critical load");
                            self.ctx.request_shutdown();
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "throttler evaluation error, will retry next tick");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("throttler shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ConnectionConfig;

    struct FakeProbe {
        lag_millis: u64,
        http_ok: bool,
    }

    #[async_trait]
    impl ThrottleProbe for FakeProbe {
        async fn http_ok(&self, _url: &str) -> Result<bool, GhostError> {
            Ok(self.http_ok)
        }
        async fn query_nonzero(&self, _query: &str) -> Result<bool, GhostError> {
            Ok(false)
        }
        async fn replica_lag_millis(&self) -> Result<u64, GhostError> {
            Ok(self.lag_millis)
        }
        async fn load_exceeds(&self, _thresholds: &str) -> Result<bool, GhostError> {
            Ok(false)
        }
    }

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
    async fn throttles_on_excessive_lag() {
        let ctx = test_ctx();
        let probe = Arc::new(FakeProbe { lag_millis: 5000, http_ok: true });
        let throttler = Throttler::new(ctx.clone(), probe, ThrottlerFlagFiles::default(), Duration::ZERO);
        throttler.evaluate_once().await.unwrap();
        let (throttled, reason) = ctx.throttle_decision();
        assert!(throttled);
        assert!(reason.contains("lag"));
    }

    #[tokio::test]
    async fn not_throttled_under_threshold() {
        let ctx = test_ctx();
        let probe = Arc::new(FakeProbe { lag_millis: 10, http_ok: true });
        let throttler = Throttler::new(ctx.clone(), probe, ThrottlerFlagFiles::default(), Duration::ZERO);
        throttler.evaluate_once().await.unwrap();
        assert!(!ctx.throttle_decision().0);
    }
}
