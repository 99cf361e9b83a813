//! Presence tracking driven by hub lifecycle events.
//!
//! The tracker holds one entry per user who is currently online or in
//! studio; offline users are not stored. State changes come from three
//! places:
//!
//! - hub lifecycle events (connect marks online, last disconnect marks
//!   offline after a live-connection recheck)
//! - client reports over the wire (`presence`, `user_in_studio`)
//! - a periodic sweep that demotes users whose activity clock went
//!   stale while no connection backs them
//!
//! Every transition fans out to the user's followers through the hub,
//! capped by [`PresenceConfig::follower_fanout_limit`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use backbeat_protocol::payload::{PresencePayload, PresenceStatus};
use backbeat_protocol::{kind, Envelope, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::FollowerDirectory;
use crate::hub::{Hub, HubEvent};

/// Inactivity budget before a user without live connections is swept
/// offline.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(300);
/// How often the sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound on followers notified per transition.
pub const FOLLOWER_FANOUT_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub timeout: Duration,
    pub sweep_interval: Duration,
    pub follower_fanout_limit: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout: PRESENCE_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            follower_fanout_limit: FOLLOWER_FANOUT_LIMIT,
        }
    }
}

/// Tracked state for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPresence {
    pub user_id: String,
    pub username: String,
    pub status: PresenceStatus,
    /// App or DAW label while in studio.
    pub context: Option<String>,
    /// Start of the current online tenure; stable across status changes
    /// until the entry is dropped.
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
}

/// Client-sent presence report. Identity comes from the connection, so
/// only the state fields are read.
#[derive(Debug, Deserialize)]
struct PresenceReport {
    status: PresenceStatus,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StudioReport {
    #[serde(default)]
    context: Option<String>,
}

pub struct PresenceTracker {
    hub: Arc<Hub>,
    directory: Arc<dyn FollowerDirectory>,
    entries: RwLock<HashMap<String, UserPresence>>,
    config: PresenceConfig,
    cancel: CancellationToken,
}

impl PresenceTracker {
    /// Wire the tracker into a running hub: register the wire handlers,
    /// consume the lifecycle event stream, start the sweeper.
    #[must_use]
    pub fn start(
        hub: Arc<Hub>,
        events: mpsc::UnboundedReceiver<HubEvent>,
        directory: Arc<dyn FollowerDirectory>,
        config: PresenceConfig,
    ) -> Arc<Self> {
        let tracker = Arc::new(Self {
            hub: Arc::clone(&hub),
            directory,
            entries: RwLock::new(HashMap::new()),
            config,
            cancel: CancellationToken::new(),
        });

        let t = Arc::clone(&tracker);
        hub.register_handler(kind::PRESENCE, move |conn, envelope| {
            let tracker = Arc::clone(&t);
            async move {
                let report: PresenceReport = envelope.parse_payload()?;
                tracker.update_presence(
                    conn.user_id(),
                    conn.username(),
                    report.status,
                    report.context,
                );
                Ok(())
            }
        });

        let t = Arc::clone(&tracker);
        hub.register_handler(kind::USER_IN_STUDIO, move |conn, envelope| {
            let tracker = Arc::clone(&t);
            async move {
                let report: StudioReport = envelope.parse_payload()?;
                tracker.update_presence(
                    conn.user_id(),
                    conn.username(),
                    PresenceStatus::InStudio,
                    report.context,
                );
                Ok(())
            }
        });

        tokio::spawn(Arc::clone(&tracker).consume_events(events));
        tokio::spawn(Arc::clone(&tracker).run_sweeper());

        tracker
    }

    /// Apply a presence change and fan the resulting transitions out to
    /// followers.
    ///
    /// Going online from offline emits `user_online`; entering the
    /// studio emits `user_in_studio`; going offline emits
    /// `user_offline` and drops the entry. Re-reporting the current
    /// status refreshes the activity clock without notifying anyone.
    pub fn update_presence(
        self: &Arc<Self>,
        user_id: &str,
        username: &str,
        status: PresenceStatus,
        context: Option<String>,
    ) {
        let mut transitions: Vec<&'static str> = Vec::new();
        {
            let mut entries = self.write_entries();
            let entry = entries
                .entry(user_id.to_string())
                .or_insert_with(|| UserPresence {
                    user_id: user_id.to_string(),
                    username: username.to_string(),
                    status: PresenceStatus::Offline,
                    context: None,
                    connected_at: Timestamp::now(),
                    last_activity: Timestamp::now(),
                });

            let was = entry.status;
            if was == PresenceStatus::Offline && status != PresenceStatus::Offline {
                transitions.push(kind::USER_ONLINE);
            }
            if status == PresenceStatus::InStudio && was != PresenceStatus::InStudio {
                transitions.push(kind::USER_IN_STUDIO);
            }
            if status == PresenceStatus::Offline && was != PresenceStatus::Offline {
                transitions.push(kind::USER_OFFLINE);
            }

            entry.username = username.to_string();
            entry.status = status;
            entry.context = context.clone();
            entry.last_activity = Timestamp::now();

            // Only live states are stored.
            if status == PresenceStatus::Offline {
                entries.remove(user_id);
            }
        }

        if transitions.is_empty() {
            return;
        }
        debug!(user = %user_id, status = %status, ?transitions, "Presence transition");

        let payload = PresencePayload {
            user_id: user_id.to_string(),
            status,
            context,
            timestamp: Timestamp::now(),
        };
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            for transition in transitions {
                tracker
                    .broadcast_to_followers(transition, payload.clone())
                    .await;
            }
        });
    }

    /// Mark a user offline if currently tracked.
    fn set_offline(self: &Arc<Self>, user_id: &str) {
        let username = {
            let entries = self.read_entries();
            match entries.get(user_id) {
                Some(entry) => entry.username.clone(),
                None => return,
            }
        };
        self.update_presence(user_id, &username, PresenceStatus::Offline, None);
    }

    async fn broadcast_to_followers(&self, transition: &'static str, payload: PresencePayload) {
        let followers = match self
            .directory
            .followers_of(&payload.user_id, self.config.follower_fanout_limit)
            .await
        {
            Ok(followers) => followers,
            Err(err) => {
                warn!(user = %payload.user_id, error = %err, "Follower lookup failed");
                return;
            }
        };

        let envelope = Envelope::new(transition, payload.clone());
        let mut notified = 0usize;
        for follower in followers {
            // Recheck liveness; offline followers would only burn a
            // hub command.
            if self.hub.is_user_online(&follower) {
                self.hub.send_to_user(follower, envelope.clone()).await;
                notified += 1;
            }
        }
        debug!(user = %payload.user_id, kind = transition, notified, "Presence fan-out");
    }

    async fn consume_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = events.recv() => {
                    let Some(event) = maybe else { break };
                    match event {
                        HubEvent::Connected(conn) => {
                            self.update_presence(
                                conn.user_id(),
                                conn.username(),
                                PresenceStatus::Online,
                                None,
                            );
                        }
                        HubEvent::Disconnected(conn) => {
                            // Events arrive post-mutation, so the count
                            // already excludes the closed connection. A
                            // surviving device means no offline flap.
                            if self.hub.user_connection_count(conn.user_id()) == 0 {
                                self.set_offline(conn.user_id());
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    /// Demote users whose activity clock is stale, unless a live
    /// connection proves they are merely quiet.
    pub fn sweep(self: &Arc<Self>) {
        let cutoff = Timestamp::now().unix_ms() - self.config.timeout.as_millis() as i64;
        let stale: Vec<String> = {
            let entries = self.read_entries();
            entries
                .values()
                .filter(|entry| entry.last_activity.unix_ms() < cutoff)
                .map(|entry| entry.user_id.clone())
                .collect()
        };

        for user_id in stale {
            if self.hub.is_user_online(&user_id) {
                if let Some(entry) = self.write_entries().get_mut(&user_id) {
                    entry.last_activity = Timestamp::now();
                }
            } else {
                debug!(user = %user_id, "Sweeping stale presence");
                self.set_offline(&user_id);
            }
        }
    }

    /// Refresh a tracked user's activity clock. Untracked users are
    /// ignored; only a status report can create an entry.
    pub fn heartbeat(&self, user_id: &str) {
        if let Some(entry) = self.write_entries().get_mut(user_id) {
            entry.last_activity = Timestamp::now();
        }
    }

    /// Stop the background tasks and mark every tracked user offline.
    pub fn shutdown(self: &Arc<Self>) {
        self.cancel.cancel();
        let users: Vec<String> = self.read_entries().keys().cloned().collect();
        for user_id in &users {
            self.set_offline(user_id);
        }
        info!(users = users.len(), "Presence tracker stopped");
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<UserPresence> {
        self.read_entries().get(user_id).cloned()
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.read_entries().len()
    }

    /// Every tracked user, ordered by id for stable output.
    #[must_use]
    pub fn all_online(&self) -> Vec<UserPresence> {
        let mut all: Vec<_> = self.read_entries().values().cloned().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    /// Presence for the requested users. Users never seen report as
    /// offline.
    #[must_use]
    pub fn presence_of(&self, user_ids: &[String]) -> Vec<UserPresence> {
        let entries = self.read_entries();
        user_ids
            .iter()
            .map(|user_id| {
                entries.get(user_id).cloned().unwrap_or_else(|| UserPresence {
                    user_id: user_id.clone(),
                    username: String::new(),
                    status: PresenceStatus::Offline,
                    context: None,
                    connected_at: Timestamp::now(),
                    last_activity: Timestamp::now(),
                })
            })
            .collect()
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, UserPresence>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, UserPresence>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, PeerInfo};
    use crate::directory::StaticDirectory;
    use crate::hub::HubConfig;
    use backbeat_protocol::codec;
    use bytes::Bytes;

    fn fast_config() -> PresenceConfig {
        PresenceConfig {
            timeout: Duration::from_millis(50),
            // Long enough that only explicit sweep() calls run.
            sweep_interval: Duration::from_secs(3600),
            follower_fanout_limit: 1000,
        }
    }

    fn start_tracker(
        directory: StaticDirectory,
        config: PresenceConfig,
    ) -> (Arc<Hub>, Arc<PresenceTracker>) {
        let (hub, events) = Hub::start(HubConfig::default());
        let tracker = PresenceTracker::start(Arc::clone(&hub), events, Arc::new(directory), config);
        (hub, tracker)
    }

    fn make_conn(hub: &Arc<Hub>, user_id: &str) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        Connection::new(
            user_id,
            user_id,
            PeerInfo::default(),
            hub.child_token(),
            &hub.connection_config(),
        )
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn recv_envelope(rx: &mut mpsc::Receiver<Bytes>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("queue still open");
        codec::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_connect_marks_online_and_notifies_followers() {
        let directory = StaticDirectory::new().with_follower("artist", "fan");
        let (hub, tracker) = start_tracker(directory, fast_config());

        let (fan, mut rx_fan) = make_conn(&hub, "fan");
        hub.register(fan).await;
        wait_until(|| tracker.get("fan").is_some()).await;

        let (artist, _rx_artist) = make_conn(&hub, "artist");
        hub.register(artist).await;
        wait_until(|| tracker.get("artist").is_some()).await;

        let presence = tracker.get("artist").unwrap();
        assert_eq!(presence.status, PresenceStatus::Online);

        let envelope = recv_envelope(&mut rx_fan).await;
        assert_eq!(envelope.kind, kind::USER_ONLINE);
        let payload: PresencePayload = envelope.parse_payload().unwrap();
        assert_eq!(payload.user_id, "artist");
        assert_eq!(payload.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_second_device_does_not_renotify() {
        let directory = StaticDirectory::new().with_follower("artist", "fan");
        let (hub, tracker) = start_tracker(directory, fast_config());

        let (fan, mut rx_fan) = make_conn(&hub, "fan");
        hub.register(fan).await;

        let (phone, _rx_phone) = make_conn(&hub, "artist");
        hub.register(phone).await;
        wait_until(|| tracker.get("artist").is_some()).await;
        let first = recv_envelope(&mut rx_fan).await;
        assert_eq!(first.kind, kind::USER_ONLINE);

        let (laptop, _rx_laptop) = make_conn(&hub, "artist");
        hub.register(laptop).await;
        wait_until(|| hub.user_connection_count("artist") == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Already online; the second device changes nothing.
        assert!(rx_fan.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_flicker_suppressed_while_devices_remain() {
        let directory = StaticDirectory::new().with_follower("artist", "fan");
        let (hub, tracker) = start_tracker(directory, fast_config());

        let (fan, mut rx_fan) = make_conn(&hub, "fan");
        hub.register(fan).await;

        let (phone, _rx_phone) = make_conn(&hub, "artist");
        let (laptop, _rx_laptop) = make_conn(&hub, "artist");
        hub.register(Arc::clone(&phone)).await;
        hub.register(laptop).await;
        wait_until(|| hub.user_connection_count("artist") == 2).await;
        let first = recv_envelope(&mut rx_fan).await;
        assert_eq!(first.kind, kind::USER_ONLINE);

        hub.unregister(phone).await;
        wait_until(|| hub.user_connection_count("artist") == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One device left: still online, no offline notice.
        assert_eq!(tracker.get("artist").unwrap().status, PresenceStatus::Online);
        assert!(rx_fan.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_disconnect_goes_offline() {
        let directory = StaticDirectory::new().with_follower("artist", "fan");
        let (hub, tracker) = start_tracker(directory, fast_config());

        let (fan, mut rx_fan) = make_conn(&hub, "fan");
        hub.register(fan).await;

        let (artist, _rx_artist) = make_conn(&hub, "artist");
        hub.register(Arc::clone(&artist)).await;
        wait_until(|| tracker.get("artist").is_some()).await;
        let first = recv_envelope(&mut rx_fan).await;
        assert_eq!(first.kind, kind::USER_ONLINE);

        hub.unregister(artist).await;
        wait_until(|| tracker.get("artist").is_none()).await;

        let envelope = recv_envelope(&mut rx_fan).await;
        assert_eq!(envelope.kind, kind::USER_OFFLINE);
        let payload: PresencePayload = envelope.parse_payload().unwrap();
        assert_eq!(payload.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_studio_transition_emits_once() {
        let directory = StaticDirectory::new().with_follower("artist", "fan");
        let (hub, tracker) = start_tracker(directory, fast_config());

        let (fan, mut rx_fan) = make_conn(&hub, "fan");
        hub.register(fan).await;

        let (artist, _rx_artist) = make_conn(&hub, "artist");
        hub.register(artist).await;
        wait_until(|| tracker.get("artist").is_some()).await;
        let first = recv_envelope(&mut rx_fan).await;
        assert_eq!(first.kind, kind::USER_ONLINE);
        let tenure_start = tracker.get("artist").unwrap().connected_at;

        tracker.update_presence(
            "artist",
            "artist",
            PresenceStatus::InStudio,
            Some("Ableton Live 12".to_string()),
        );

        let envelope = recv_envelope(&mut rx_fan).await;
        assert_eq!(envelope.kind, kind::USER_IN_STUDIO);
        let payload: PresencePayload = envelope.parse_payload().unwrap();
        assert_eq!(payload.context.as_deref(), Some("Ableton Live 12"));

        // Re-reporting the same status only refreshes the clock.
        tracker.update_presence(
            "artist",
            "artist",
            PresenceStatus::InStudio,
            Some("Ableton Live 12".to_string()),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_fan.try_recv().is_err());

        let presence = tracker.get("artist").unwrap();
        assert_eq!(presence.status, PresenceStatus::InStudio);
        assert_eq!(presence.context.as_deref(), Some("Ableton Live 12"));
        // Status changes do not restart the tenure.
        assert_eq!(presence.connected_at, tenure_start);
    }

    #[tokio::test]
    async fn test_offline_followers_are_skipped() {
        let directory = StaticDirectory::new()
            .with_follower("artist", "here_fan")
            .with_follower("artist", "away_fan");
        let (hub, tracker) = start_tracker(directory, fast_config());

        let (here, mut rx_here) = make_conn(&hub, "here_fan");
        hub.register(here).await;
        wait_until(|| tracker.get("here_fan").is_some()).await;

        let (artist, _rx_artist) = make_conn(&hub, "artist");
        hub.register(artist).await;

        let envelope = recv_envelope(&mut rx_here).await;
        assert_eq!(envelope.kind, kind::USER_ONLINE);
        // Only the connected follower was targeted.
        assert_eq!(hub.metrics().snapshot().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_sweep_demotes_stale_without_connection() {
        let (_hub, tracker) = start_tracker(StaticDirectory::new(), fast_config());

        // Tracked but not backed by any hub connection.
        tracker.update_presence("phantom", "phantom", PresenceStatus::Online, None);
        assert!(tracker.get("phantom").is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        tracker.sweep();

        assert!(tracker.get("phantom").is_none());
        assert_eq!(tracker.online_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_defers_the_sweep() {
        let (_hub, tracker) = start_tracker(StaticDirectory::new(), fast_config());

        tracker.update_presence("phantom", "phantom", PresenceStatus::Online, None);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Activity just before the sweep keeps the entry alive even
        // without a hub connection behind it.
        tracker.heartbeat("phantom");
        tracker.sweep();
        assert!(tracker.get("phantom").is_some());
    }

    #[tokio::test]
    async fn test_sweep_refreshes_live_connections() {
        let (hub, tracker) = start_tracker(StaticDirectory::new(), fast_config());

        let (artist, _rx) = make_conn(&hub, "artist");
        hub.register(artist).await;
        wait_until(|| tracker.get("artist").is_some()).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let before = tracker.get("artist").unwrap().last_activity;
        tracker.sweep();

        // Quiet but connected: clock refreshed instead of demoted.
        let after = tracker.get("artist").unwrap();
        assert_eq!(after.status, PresenceStatus::Online);
        assert!(after.last_activity.unix_ms() > before.unix_ms());
    }

    #[tokio::test]
    async fn test_shutdown_marks_everyone_offline() {
        let (_hub, tracker) = start_tracker(StaticDirectory::new(), fast_config());

        tracker.update_presence("a", "a", PresenceStatus::Online, None);
        tracker.update_presence("b", "b", PresenceStatus::InStudio, Some("Logic Pro".into()));
        assert_eq!(tracker.online_count(), 2);

        tracker.shutdown();
        assert_eq!(tracker.online_count(), 0);
        assert!(tracker.all_online().is_empty());
    }

    #[tokio::test]
    async fn test_presence_of_defaults_to_offline() {
        let (_hub, tracker) = start_tracker(StaticDirectory::new(), fast_config());
        tracker.update_presence("artist", "artist", PresenceStatus::Online, None);

        let listed = tracker.presence_of(&["artist".to_string(), "stranger".to_string()]);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].status, PresenceStatus::Online);
        assert_eq!(listed[1].user_id, "stranger");
        assert_eq!(listed[1].status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_wire_handlers_update_tracker() {
        let (hub, tracker) = start_tracker(StaticDirectory::new(), fast_config());
        let (conn, _rx) = make_conn(&hub, "artist");

        let handler = hub.handler(kind::USER_IN_STUDIO).expect("handler registered");
        let report = Envelope::new(
            kind::USER_IN_STUDIO,
            serde_json::json!({"context": "FL Studio"}),
        );
        handler(Arc::clone(&conn), report).await.unwrap();

        let presence = tracker.get("artist").unwrap();
        assert_eq!(presence.status, PresenceStatus::InStudio);
        assert_eq!(presence.context.as_deref(), Some("FL Studio"));

        let handler = hub.handler(kind::PRESENCE).expect("handler registered");
        let bogus = Envelope::new(kind::PRESENCE, serde_json::json!({"status": 17}));
        assert!(handler(conn, bogus).await.is_err());
    }
}
