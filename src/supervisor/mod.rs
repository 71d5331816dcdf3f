//! Reconnection supervisors.
//!
//! Two sweeps keep sessions connected:
//! - the boot sweep runs once after a grace delay, activates a session for
//!   every active registered user and reconnects according to
//!   `boot_policy`;
//! - the health sweep runs every `interval_secs` over whatever the registry
//!   holds and reconnects according to `periodic_policy`.
//!
//! Both only ever move a session forward (connect). Failures are logged and
//! retried on the next tick. A session whose operation lock is held by a
//! foreground call is skipped for that tick.

use crate::error::UserId;
use crate::session::{Session, SessionManager, SessionStatus};
use crate::users::UserRepository;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Which disconnected sessions a sweep reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Only sessions that have completed pairing.
    LoggedInOnly,
    /// Every disconnected session, including ones mid-pairing.
    AnyDisconnected,
}

impl ReconnectPolicy {
    pub fn wants(self, status: &SessionStatus) -> bool {
        if status.is_connected {
            return false;
        }
        match self {
            Self::LoggedInOnly => status.is_logged_in,
            Self::AnyDisconnected => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoggedInOnly => "logged_in_only",
            Self::AnyDisconnected => "any_disconnected",
        }
    }
}

impl fmt::Display for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts from one pass over a set of sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    /// Already connected.
    pub healthy: usize,
    pub reconnected: usize,
    pub failed: usize,
    /// Disconnected but excluded by the policy.
    pub ineligible: usize,
    /// Operation lock held elsewhere, retired, or missing a handle.
    pub skipped: usize,
}

enum Outcome {
    Healthy,
    Reconnected,
    Failed,
    Ineligible,
    Skipped,
}

impl SweepReport {
    fn record(&mut self, outcome: Outcome) {
        self.scanned += 1;
        match outcome {
            Outcome::Healthy => self.healthy += 1,
            Outcome::Reconnected => self.reconnected += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Ineligible => self.ineligible += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Result of the boot sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootReport {
    /// The user list was empty or unreadable; existing sessions were swept instead.
    pub fallback: bool,
    pub users_total: usize,
    pub inactive_skipped: usize,
    pub activation_failed: usize,
    /// Per-session status before reconnecting.
    pub statuses: Vec<StatusLine>,
    pub sweep: SweepReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub user_id: UserId,
    pub username: String,
    pub status: &'static str,
}

async fn reconnect_one(session: Arc<Session>, policy: ReconnectPolicy) -> Outcome {
    let user_id = session.user_id();
    if session.is_retired() {
        return Outcome::Skipped;
    }
    let Some(conn) = session.connection().cloned() else {
        tracing::warn!(user_id, "Session has no connection handle; skipping");
        return Outcome::Skipped;
    };
    let Some(_ops) = session.try_lock_ops() else {
        tracing::debug!(user_id, "Session busy; skipping this tick");
        return Outcome::Skipped;
    };
    if session.is_retired() {
        return Outcome::Skipped;
    }

    let status = session.status();
    if status.is_connected {
        return Outcome::Healthy;
    }
    if !policy.wants(&status) {
        tracing::debug!(user_id, %policy, "Session not eligible for reconnect");
        return Outcome::Ineligible;
    }

    match conn.connect().await {
        Ok(()) => {
            tracing::info!(user_id, username = session.username(), "Session reconnected");
            Outcome::Reconnected
        }
        Err(e) => {
            tracing::warn!(user_id, username = session.username(), "Reconnect failed: {e}");
            Outcome::Failed
        }
    }
}

async fn sweep_sessions(
    sessions: impl IntoIterator<Item = Arc<Session>>,
    policy: ReconnectPolicy,
) -> SweepReport {
    let mut tasks = JoinSet::new();
    for session in sessions {
        tasks.spawn(reconnect_one(session, policy));
    }

    let mut report = SweepReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => report.record(outcome),
            Err(e) => {
                tracing::error!("Reconnect task aborted: {e}");
                report.record(Outcome::Failed);
            }
        }
    }
    report
}

/// One pass over every session in the registry.
pub async fn sweep(manager: &SessionManager, policy: ReconnectPolicy) -> SweepReport {
    sweep_sessions(manager.list_active().into_values(), policy).await
}

/// Activate a session for each active user and reconnect per `policy`.
pub async fn boot_sweep(
    manager: &SessionManager,
    users: &dyn UserRepository,
    policy: ReconnectPolicy,
) -> BootReport {
    let mut report = BootReport::default();

    let registered = match users.get_all() {
        Ok(list) if !list.is_empty() => Some(list),
        Ok(_) => {
            tracing::info!("No registered users; sweeping existing sessions");
            None
        }
        Err(e) => {
            tracing::error!("Failed to load users: {e:#}; sweeping existing sessions");
            None
        }
    };

    let sessions: Vec<Arc<Session>> = match registered {
        Some(list) => {
            report.users_total = list.len();
            let mut sessions = Vec::with_capacity(list.len());
            for user in list {
                if !user.is_active {
                    tracing::debug!(user_id = user.id, username = %user.username, "Skipping inactive user");
                    report.inactive_skipped += 1;
                    continue;
                }
                match manager.activate_session(user.id, &user.username) {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        tracing::error!(user_id = user.id, username = %user.username, "Failed to create session: {e}");
                        report.activation_failed += 1;
                    }
                }
            }
            sessions
        }
        None => {
            report.fallback = true;
            manager.list_active().into_values().collect()
        }
    };

    report.statuses = status_summary(&sessions);
    report.sweep = sweep_sessions(sessions, policy).await;

    tracing::info!(
        %policy,
        fallback = report.fallback,
        users = report.users_total,
        inactive = report.inactive_skipped,
        reconnected = report.sweep.reconnected,
        failed = report.sweep.failed,
        ineligible = report.sweep.ineligible,
        "Boot sweep finished"
    );
    report
}

fn status_summary(sessions: &[Arc<Session>]) -> Vec<StatusLine> {
    let mut lines: Vec<StatusLine> = sessions
        .iter()
        .map(|session| StatusLine {
            user_id: session.user_id(),
            username: session.username().to_string(),
            status: session.status().label(),
        })
        .collect();
    lines.sort_by_key(|line| line.user_id);

    for line in &lines {
        tracing::info!(user_id = line.user_id, username = %line.username, "{}", line.status);
    }
    let logged_in = sessions.iter().filter(|s| s.status().is_logged_in).count();
    let connected = sessions.iter().filter(|s| s.status().is_connected).count();
    tracing::info!(total = lines.len(), logged_in, connected, "Session status summary");
    lines
}

/// Run the boot sweep once after `grace`, unless cancelled first.
pub fn spawn_boot_sweep(
    manager: Arc<SessionManager>,
    users: Arc<dyn UserRepository>,
    policy: ReconnectPolicy,
    grace: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Option<BootReport>> {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(grace) => {}
        }
        Some(boot_sweep(&manager, users.as_ref(), policy).await)
    })
}

/// Sweep the registry every `interval` until cancelled. The first sweep
/// happens one full interval after start.
pub fn spawn_health_supervisor(
    manager: Arc<SessionManager>,
    policy: ReconnectPolicy,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(%policy, interval_secs = interval.as_secs(), "Health supervisor started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = sweep(&manager, policy).await;
                    if report.reconnected > 0 || report.failed > 0 {
                        tracing::info!(
                            scanned = report.scanned,
                            reconnected = report.reconnected,
                            failed = report.failed,
                            "Health sweep"
                        );
                    } else {
                        tracing::debug!(scanned = report.scanned, "Health sweep: nothing to do");
                    }
                }
            }
        }
        tracing::info!("Health supervisor stopped");
    })
}
