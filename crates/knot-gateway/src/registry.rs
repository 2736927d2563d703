//! Process-wide index of groups by team and sessions by connection.
//!
//! Both maps live under one lock so that "group exists iff it has members"
//! and "connection index entry exists iff the session is a group member"
//! hold at every point another task can observe. Lock order is always
//! registry, then group. Closing sessions is network I/O and happens only
//! after the registry lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use knot_core::{ConnectionId, TeamId};
use metrics::gauge;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::broadcaster;
use crate::config::BroadcastConfig;
use crate::group::Group;
use crate::session::Session;

#[derive(Debug, Default)]
struct Indices {
    groups: HashMap<TeamId, Arc<Group>>,
    connections: HashMap<ConnectionId, Arc<Session>>,
}

/// Index of live groups and sessions.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Indices>,
    broadcast: Option<BroadcastConfig>,
    this: Weak<Registry>,
}

impl Registry {
    /// Registry without broadcasting.
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Registry that starts a broadcaster for every group it creates.
    ///
    /// Fails with [`knot_core::GatewayError::Config`] on a zero interval.
    pub fn with_broadcast(config: BroadcastConfig) -> knot_core::Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::build(Some(config)))
    }

    fn build(broadcast: Option<BroadcastConfig>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner: RwLock::new(Indices::default()),
            broadcast,
            this: this.clone(),
        })
    }

    /// Register `session`, creating its team's group if needed.
    ///
    /// A session already present for the same team and user is superseded:
    /// it is dropped from both indices, closed, and returned.
    pub async fn add(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let (group, created, superseded) = {
            let mut inner = self.inner.write();
            let Indices {
                groups,
                connections,
            } = &mut *inner;

            let _ = connections.insert(session.connection_id().clone(), session.clone());

            let mut created = false;
            let group = groups
                .entry(session.team_id().clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Group::linked(session.team_id().clone(), self.this.clone()))
                })
                .clone();

            let superseded = group.insert(session.clone());
            if let Some(previous) = &superseded {
                let _ = connections.remove(previous.connection_id());
            }
            record_gauges(groups.len(), connections.len());
            (group, created, superseded)
        };

        if created {
            debug!(team_id = %session.team_id(), "group created");
            if let Some(config) = &self.broadcast {
                let _ = broadcaster::spawn(self.this.clone(), group.clone(), config.clone());
            }
        }

        info!(
            team_id = %session.team_id(),
            user_id = %session.user_id(),
            conn_id = %session.connection_id(),
            "session registered"
        );

        if let Some(previous) = &superseded {
            previous.close().await;
        }
        superseded
    }

    /// Remove the session registered under `connection_id` and close it.
    ///
    /// Deletes the session's group when it becomes empty. Returns `None`
    /// when the connection is unknown (already removed or superseded), in
    /// which case nothing else is touched.
    pub async fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<Session>> {
        let session = {
            let mut inner = self.inner.write();
            let session = inner.connections.remove(connection_id)?;
            if let Some(group) = inner.groups.get(session.team_id()).cloned() {
                let _ = group.detach(&session);
                if group.is_empty() {
                    let _ = inner.groups.remove(session.team_id());
                    group.retire();
                    debug!(team_id = %session.team_id(), "group deleted");
                }
            }
            record_gauges(inner.groups.len(), inner.connections.len());
            session
        };

        info!(
            team_id = %session.team_id(),
            user_id = %session.user_id(),
            conn_id = %connection_id,
            "session removed"
        );
        session.close().await;
        Some(session)
    }

    /// Group for `team_id`, if it exists.
    pub fn get(&self, team_id: &TeamId) -> Option<Arc<Group>> {
        self.inner.read().groups.get(team_id).cloned()
    }

    /// Session registered under `connection_id`.
    pub fn session(&self, connection_id: &ConnectionId) -> Option<Arc<Session>> {
        self.inner.read().connections.get(connection_id).cloned()
    }

    /// Number of live groups.
    pub fn count(&self) -> usize {
        self.inner.read().groups.len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Teams that currently have a group, sorted.
    pub fn teams(&self) -> Vec<TeamId> {
        let mut teams: Vec<TeamId> = self.inner.read().groups.keys().cloned().collect();
        teams.sort();
        teams
    }

    /// Empty the registry and close every session concurrently.
    /// Returns the number of sessions closed.
    pub async fn close_all(&self) -> usize {
        let groups: Vec<Arc<Group>> = {
            let mut inner = self.inner.write();
            inner.connections.clear();
            let groups: Vec<Arc<Group>> = inner.groups.drain().map(|(_, g)| g).collect();
            for group in &groups {
                group.retire();
            }
            record_gauges(0, 0);
            groups
        };
        info!(groups = groups.len(), "closing all sessions");
        let closed = futures::future::join_all(groups.iter().map(|g| g.close_all())).await;
        closed.into_iter().sum()
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_gauges(groups: usize, sessions: usize) {
    gauge!(crate::metrics::GROUPS_ACTIVE).set(groups as f64);
    gauge!(crate::metrics::SESSIONS_ACTIVE).set(sessions as f64);
}
