//! Periodic per-team fan-out.
//!
//! The registry spawns one broadcaster per group it creates. Each tick
//! re-checks that the registry still maps the team to this exact group; a
//! group that was deleted (or replaced by a newer instance) ends its task
//! quietly. Delivery to members is independent and concurrent: one member
//! with a full queue costs the others nothing.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::BroadcastConfig;
use crate::group::Group;
use crate::registry::Registry;
use crate::session::Session;

/// Floor for the tick period; `interval_at` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Why a broadcaster task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastExit {
    /// The group was deleted or the registry shut down.
    Retired,
    /// The registry no longer maps the team to this group.
    GroupGone,
    /// The registry itself was dropped.
    RegistryDropped,
}

/// Outcome of one broadcast tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Members whose queue accepted the payload.
    pub delivered: usize,
    /// Members that were skipped (full queue or closed).
    pub dropped: usize,
}

/// Spawn the broadcaster for `group`.
pub fn spawn(
    registry: Weak<Registry>,
    group: Arc<Group>,
    config: BroadcastConfig,
) -> JoinHandle<BroadcastExit> {
    tokio::spawn(run(registry, group, config))
}

/// Broadcast loop. Runs until the group is retired or no longer current.
pub async fn run(registry: Weak<Registry>, group: Arc<Group>, config: BroadcastConfig) -> BroadcastExit {
    let retired = group.retired_token();
    let period = config.interval.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(team_id = %group.team_id(), interval = ?period, "broadcaster started");

    let exit = loop {
        tokio::select! {
            biased;
            () = retired.cancelled() => break BroadcastExit::Retired,
            _ = ticker.tick() => {}
        }

        let Some(registry) = registry.upgrade() else {
            break BroadcastExit::RegistryDropped;
        };
        match registry.get(group.team_id()) {
            Some(current) if Arc::ptr_eq(&current, &group) => {}
            _ => break BroadcastExit::GroupGone,
        }
        drop(registry);

        let report = tick(&group, &config).await;
        trace!(
            team_id = %group.team_id(),
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast tick"
        );
    };

    debug!(team_id = %group.team_id(), ?exit, "broadcaster stopped");
    exit
}

/// Deliver the configured payload to every current member once.
pub async fn tick(group: &Arc<Group>, config: &BroadcastConfig) -> TickReport {
    let members = group.members();
    let results = join_all(members.iter().map(|session| deliver(session, group, config))).await;

    let delivered = results.iter().filter(|ok| **ok).count();
    let report = TickReport {
        delivered,
        dropped: results.len() - delivered,
    };
    counter!(crate::metrics::BROADCAST_TICKS_TOTAL).increment(1);
    counter!(crate::metrics::BROADCAST_DELIVERIES_TOTAL).increment(report.delivered as u64);
    report
}

async fn deliver(session: &Arc<Session>, group: &Arc<Group>, config: &BroadcastConfig) -> bool {
    let payload = config.payload.clone();
    let result = match config.send_timeout {
        Some(wait) => session.send_timeout(group, payload, wait).await,
        None => session.send(group, payload),
    };
    if let Err(err) = &result {
        trace!(
            team_id = %session.team_id(),
            user_id = %session.user_id(),
            error = %err,
            "broadcast skipped member"
        );
    }
    result.is_ok()
}
