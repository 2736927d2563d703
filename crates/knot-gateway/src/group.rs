//! Sessions of one team, keyed by user.
//!
//! A group holds at most one session per user. Adding a session for a user
//! who is already present supersedes the old one, which is cancelled
//! immediately and closed after the group lock is released.
//!
//! Groups created by the [`Registry`] keep a weak link back to it so that a
//! session removing itself (on write failure) goes through the registry and
//! both indices stay consistent.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use knot_core::{TeamId, UserId};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::Registry;
use crate::session::Session;

/// Set of sessions for one team.
#[derive(Debug)]
pub struct Group {
    team_id: TeamId,
    members: RwLock<HashMap<UserId, Arc<Session>>>,
    registry: Weak<Registry>,
    retired: CancellationToken,
}

impl Group {
    /// Standalone group not attached to any registry.
    pub fn new(team_id: TeamId) -> Self {
        Self::linked(team_id, Weak::new())
    }

    pub(crate) fn linked(team_id: TeamId, registry: Weak<Registry>) -> Self {
        Self {
            team_id,
            members: RwLock::new(HashMap::new()),
            registry,
            retired: CancellationToken::new(),
        }
    }

    /// Team this group belongs to.
    pub fn team_id(&self) -> &TeamId {
        &self.team_id
    }

    /// Add `session`, superseding and closing any session already present
    /// for the same user. Returns the superseded session.
    pub async fn add(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let superseded = self.insert(session);
        if let Some(previous) = &superseded {
            previous.close().await;
        }
        superseded
    }

    /// Insert under the lock. A superseded session is cancelled but not
    /// closed; the caller closes it once all locks are released.
    pub(crate) fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let user_id = session.user_id().clone();
        let previous = self.members.write().insert(user_id, session.clone());
        match previous {
            Some(previous) if Arc::ptr_eq(&previous, &session) => None,
            Some(previous) => {
                previous.cancel();
                debug!(
                    team_id = %self.team_id,
                    user_id = %session.user_id(),
                    superseded = %previous.connection_id(),
                    "session superseded"
                );
                Some(previous)
            }
            None => None,
        }
    }

    /// Remove exactly this session instance from the map.
    ///
    /// A newer session registered for the same user is left alone.
    pub(crate) fn detach(&self, session: &Arc<Session>) -> bool {
        let mut members = self.members.write();
        match members.get(session.user_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                let _ = members.remove(session.user_id());
                true
            }
            _ => false,
        }
    }

    /// Remove `session` and close it. Returns whether it was a member.
    ///
    /// When the group belongs to a live registry the removal is routed
    /// through [`Registry::remove`], which also drops the connection index
    /// entry and deletes the group once it is empty.
    pub async fn remove(&self, session: &Arc<Session>) -> bool {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(session.connection_id()).await.is_some() {
                return true;
            }
        }
        let removed = self.detach(session);
        session.close().await;
        removed
    }

    /// Current session for `user_id`.
    pub fn get(&self, user_id: &UserId) -> Option<Arc<Session>> {
        self.members.read().get(user_id).cloned()
    }

    /// Number of member sessions.
    pub fn count(&self) -> usize {
        self.members.read().len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<Arc<Session>> {
        self.members.read().values().cloned().collect()
    }

    /// Remove every member and close them concurrently.
    /// Returns the number of sessions closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.members.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.cancel();
        }
        let _ = join_all(drained.iter().map(|s| s.close())).await;
        drained.len()
    }

    /// Mark the group as deleted. Stops its broadcaster.
    pub(crate) fn retire(&self) {
        self.retired.cancel();
    }

    /// Whether the group has been deleted from its registry.
    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    pub(crate) fn retired_token(&self) -> CancellationToken {
        self.retired.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::testing::RecordingConnection;
    use bytes::Bytes;
    use std::time::Duration;

    fn session(team: &str, user: &str) -> (Arc<Session>, Arc<RecordingConnection>) {
        let conn = RecordingConnection::new();
        let session = Session::new(
            team.into(),
            user.into(),
            conn.clone(),
            &SessionConfig {
                queue_capacity: 4,
                write_timeout: Duration::from_millis(100),
            },
        );
        (session, conn)
    }

    // ── add / get ───────────────────────────────────────────────────

    #[tokio::test]
    async fn add_and_get() {
        let group = Group::new("t1".into());
        let (s1, _) = session("t1", "u1");
        let (s2, _) = session("t1", "u2");

        assert!(group.add(s1.clone()).await.is_none());
        assert!(group.add(s2.clone()).await.is_none());

        assert_eq!(group.count(), 2);
        assert!(Arc::ptr_eq(&group.get(&"u1".into()).unwrap(), &s1));
        assert!(Arc::ptr_eq(&group.get(&"u2".into()).unwrap(), &s2));
        assert!(group.get(&"u3".into()).is_none());
    }

    #[tokio::test]
    async fn duplicate_user_supersedes() {
        let group = Group::new("t1".into());
        let (first, first_conn) = session("t1", "u1");
        let (second, _) = session("t1", "u1");

        let _ = group.add(first.clone()).await;
        let superseded = group.add(second.clone()).await.unwrap();

        assert!(Arc::ptr_eq(&superseded, &first));
        assert_eq!(group.count(), 1);
        assert!(Arc::ptr_eq(&group.get(&"u1".into()).unwrap(), &second));
        assert!(first.is_closed());
        assert!(first_conn.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn readding_same_session_is_noop() {
        let group = Group::new("t1".into());
        let (s, _) = session("t1", "u1");
        let _ = group.add(s.clone()).await;
        assert!(group.add(s.clone()).await.is_none());
        assert_eq!(group.count(), 1);
        assert!(!s.is_cancelled());
    }

    // ── remove ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn remove_closes_session() {
        let group = Group::new("t1".into());
        let (s, conn) = session("t1", "u1");
        let _ = group.add(s.clone()).await;

        assert!(group.remove(&s).await);
        assert!(group.is_empty());
        assert!(s.is_closed());
        assert!(conn.close_notified());
    }

    #[tokio::test]
    async fn stale_remove_keeps_replacement() {
        let group = Group::new("t1".into());
        let (old, _) = session("t1", "u1");
        let (new, _) = session("t1", "u1");
        let _ = group.add(old.clone()).await;
        let _ = group.add(new.clone()).await;

        assert!(!group.remove(&old).await);
        assert_eq!(group.count(), 1);
        assert!(Arc::ptr_eq(&group.get(&"u1".into()).unwrap(), &new));
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn remove_absent_still_closes() {
        let group = Group::new("t1".into());
        let (s, _) = session("t1", "u1");
        assert!(!group.remove(&s).await);
        assert!(s.is_closed());
    }

    // ── snapshot / close_all ────────────────────────────────────────

    #[tokio::test]
    async fn members_snapshot_is_detached() {
        let group = Group::new("t1".into());
        let (s1, _) = session("t1", "u1");
        let (s2, _) = session("t1", "u2");
        let _ = group.add(s1.clone()).await;
        let _ = group.add(s2).await;

        let snapshot = group.members();
        let _ = group.remove(&s1).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(group.count(), 1);
    }

    #[tokio::test]
    async fn close_all_drains_members() {
        let group = Group::new("t1".into());
        let mut conns = Vec::new();
        for user in ["u1", "u2", "u3"] {
            let (s, c) = session("t1", user);
            let _ = group.add(s).await;
            conns.push(c);
        }

        assert_eq!(group.close_all().await, 3);
        assert!(group.is_empty());
        assert!(conns.iter().all(|c| c.is_closed()));
    }

    #[tokio::test]
    async fn close_all_is_bounded_with_hanging_peer() {
        let group = Group::new("t1".into());
        let (stuck, stuck_conn) = session("t1", "u1");
        let (fine, fine_conn) = session("t1", "u2");
        stuck_conn.set_hanging(true);
        let _ = group.add(stuck).await;
        let _ = group.add(fine).await;

        let result = tokio::time::timeout(Duration::from_secs(1), group.close_all()).await;
        assert_eq!(result.unwrap(), 2);
        assert!(fine_conn.is_closed());
    }

    #[tokio::test]
    async fn send_through_group_reference() {
        let group = Arc::new(Group::new("t1".into()));
        let (s, conn) = session("t1", "u1");
        let _ = group.add(s.clone()).await;
        let _loop = tokio::spawn(s.clone().run());

        s.send(&group, Bytes::from("hi")).unwrap();
        assert!(conn.wait_for_sent(1, Duration::from_secs(1)).await);
        s.close().await;
    }

    #[test]
    fn retire_flags_group() {
        let group = Group::new("t1".into());
        assert!(!group.is_retired());
        group.retire();
        assert!(group.is_retired());
        assert!(group.retired_token().is_cancelled());
    }

    // ── properties ──────────────────────────────────────────────────

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn membership_tracks_add_remove_sequence(
                steps in proptest::collection::vec((0u8..5, any::<bool>()), 1..30)
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let group = Group::new("t".into());
                    let mut latest: HashMap<String, Arc<Session>> = HashMap::new();
                    for (u, add) in &steps {
                        let user = format!("u{u}");
                        if *add {
                            let (s, _) = session("t", &user);
                            let _ = group.add(s.clone()).await;
                            if let Some(old) = latest.insert(user, s) {
                                prop_assert!(old.is_cancelled());
                            }
                        } else if let Some(current) = latest.remove(&user) {
                            prop_assert!(group.remove(&current).await);
                            prop_assert!(current.is_closed());
                        } else {
                            let (stranger, _) = session("t", &user);
                            prop_assert!(!group.remove(&stranger).await);
                        }

                        prop_assert_eq!(group.count(), latest.len());
                        for id in 0u8..5 {
                            let user = format!("u{id}");
                            let current = group.get(&user.as_str().into());
                            match latest.get(&user) {
                                Some(s) => {
                                    prop_assert!(current.is_some_and(|c| Arc::ptr_eq(&c, s)));
                                    prop_assert!(!s.is_cancelled());
                                }
                                None => prop_assert!(current.is_none()),
                            }
                        }
                    }
                    Ok(())
                })?;
            }
        }
    }
}
