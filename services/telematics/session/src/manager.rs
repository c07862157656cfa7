//! Concurrent registry of device sessions
//!
//! Sessions are keyed by device id in a sharded map, so creating or removing
//! one device only locks the shard holding its key. Enumerations walk the map
//! one shard at a time and return owned snapshots. Listeners are always
//! notified after every map guard has been dropped.

use crate::connection::{DeviceConnection, SharedConnection};
use crate::listener::SessionListener;
use crate::session::DeviceSession;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use telematics_protocol::{DeviceCommand, DeviceMessage, Protocol};
use tracing::{debug, info};

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions moved to idle
    pub idled: usize,
    /// Sessions removed after timing out
    pub removed: usize,
    /// Connection records dropped after the retention window
    pub pruned: usize,
}

/// The shared session registry
#[derive(Debug, Default)]
pub struct DeviceSessionManager {
    sessions: DashMap<String, Arc<DeviceSession>>,
    /// Durable records, kept across session removal
    connections: DashMap<String, SharedConnection>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl DeviceSessionManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    /// Unregister a listener by identity
    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    /// Existing session for `device_id`, or a newly registered one.
    ///
    /// Concurrent first contact for the same id always yields the same
    /// instance and exactly one `on_session_created` notification.
    pub fn get_or_create(
        &self,
        device_id: &str,
        protocol: Arc<dyn Protocol>,
        realm: &str,
    ) -> Arc<DeviceSession> {
        if let Some(existing) = self.sessions.get(device_id) {
            return existing.value().clone();
        }

        let (session, created) = match self.sessions.entry(device_id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let connection = self.connection_record(device_id, protocol.vendor_id(), realm);
                let session = Arc::new(DeviceSession::new(device_id, realm, protocol, connection));
                entry.insert(session.clone());
                (session, true)
            }
        };

        if created {
            info!(
                "Created session for device {} (realm={}, protocol={})",
                device_id,
                realm,
                session.protocol_id()
            );
            for listener in self.listeners() {
                listener.on_session_created(&session);
            }
        }
        session
    }

    /// Session for `device_id`
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.get(device_id).map(|entry| entry.value().clone())
    }

    /// Session whose device resolved to `asset_id`
    pub fn get_by_asset_id(&self, asset_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().asset_id().as_deref() == Some(asset_id))
            .map(|entry| entry.value().clone())
    }

    /// Remove and retire the session for `device_id`.
    ///
    /// Queued commands are failed through `on_command_failed`. The durable
    /// connection record is kept.
    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        let (_, session) = self.sessions.remove(device_id)?;
        self.retire(&session, "removed");
        Some(session)
    }

    /// Close the current connection of a session without removing it
    pub fn disconnect(&self, device_id: &str) -> bool {
        let Some(session) = self.get(device_id) else {
            return false;
        };

        let failed = session.on_disconnect();
        self.notify_disconnected(&session, &failed);
        true
    }

    /// Close the session's lifecycle only if `connection_key` opened it.
    ///
    /// A close reported for a connection the device has already replaced
    /// leaves the live lifecycle untouched and returns `false`.
    pub fn disconnect_connection(&self, device_id: &str, connection_key: &str) -> bool {
        let Some(session) = self.get(device_id) else {
            return false;
        };

        match session.on_disconnect_from(connection_key) {
            Some(failed) => {
                self.notify_disconnected(&session, &failed);
                true
            }
            None => {
                debug!(
                    "Ignoring close of stale connection {} for device {}",
                    connection_key, device_id
                );
                false
            }
        }
    }

    /// Apply a decoded message and notify listeners
    pub fn on_message(&self, session: &Arc<DeviceSession>, message: &DeviceMessage) -> bool {
        if !session.on_message(message) {
            debug!(
                "Dropping message for retired session of device {}",
                session.device_id()
            );
            return false;
        }
        for listener in self.listeners() {
            listener.on_session_message(session, message);
        }
        true
    }

    /// Snapshot of every session
    pub fn all(&self) -> Vec<Arc<DeviceSession>> {
        self.snapshot(|_| true)
    }

    /// Snapshot of the sessions in `realm`
    pub fn by_realm(&self, realm: &str) -> Vec<Arc<DeviceSession>> {
        self.snapshot(|session| session.realm() == realm)
    }

    /// Snapshot of the sessions bound to `protocol_id`
    pub fn by_protocol(&self, protocol_id: &str) -> Vec<Arc<DeviceSession>> {
        self.snapshot(|session| session.protocol_id() == protocol_id)
    }

    /// Remove sessions without contact for more than `timeout_secs`
    pub fn cleanup_timed_out(&self, timeout_secs: u64) -> usize {
        self.cleanup_timed_out_at(timeout_secs, Utc::now())
    }

    /// Timeout cleanup against an explicit clock.
    ///
    /// Each candidate is removed only if the registry still maps its id to
    /// the same instance and it is still timed out.
    pub fn cleanup_timed_out_at(&self, timeout_secs: u64, now: DateTime<Utc>) -> usize {
        let candidates = self.snapshot(|session| session.is_timed_out_at(timeout_secs, now));

        let removed = candidates
            .iter()
            .filter(|candidate| self.remove_if_timed_out(candidate, timeout_secs, now))
            .count();

        if removed > 0 {
            info!("Removed {} timed out sessions", removed);
        }
        removed
    }

    /// Mark idle sessions, remove timed out ones, then drop connection
    /// records of devices silent for longer than `retention_secs`
    pub fn sweep_at(
        &self,
        idle_after_secs: u64,
        timeout_secs: u64,
        retention_secs: u64,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let idled = self
            .all()
            .iter()
            .filter(|session| session.mark_idle_at(idle_after_secs, now))
            .count();
        let removed = self.cleanup_timed_out_at(timeout_secs, now);
        let pruned = self.prune_connections_at(retention_secs, now);

        debug!(
            "Sweep finished: idled={}, removed={}, pruned={}",
            idled, removed, pruned
        );
        SweepReport {
            idled,
            removed,
            pruned,
        }
    }

    /// Number of registered sessions
    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of devices with an open physical connection
    pub fn connected_device_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().lock().is_connected())
            .count()
    }

    /// Snapshot of the connection record for `device_id`
    pub fn connection(&self, device_id: &str) -> Option<DeviceConnection> {
        self.connections
            .get(device_id)
            .map(|entry| entry.value().lock().clone())
    }

    /// Snapshot of every known connection record
    pub fn connections(&self) -> Vec<DeviceConnection> {
        self.connections
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect()
    }

    /// Snapshot of the connection records of one vendor
    pub fn connections_by_vendor(&self, vendor_id: &str) -> Vec<DeviceConnection> {
        self.connections
            .iter()
            .map(|entry| entry.value().lock().clone())
            .filter(|conn| conn.vendor_id() == vendor_id)
            .collect()
    }

    /// Drop the durable record of a device.
    ///
    /// Refused while the device still has a registered session.
    pub fn remove_connection(&self, device_id: &str) -> Option<DeviceConnection> {
        // Hold the session slot so no session can be created meanwhile
        let removed = match self.sessions.entry(device_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(
                    "Keeping connection record of {}: session still registered",
                    device_id
                );
                return None;
            }
            Entry::Vacant(_slot) => self.connections.remove(device_id),
        };

        removed.map(|(_, conn)| conn.lock().clone())
    }

    /// Drop records of devices with no session, no open connection and no
    /// contact for more than `retention_secs`
    pub fn prune_connections_at(&self, retention_secs: u64, now: DateTime<Utc>) -> usize {
        let retention_ms = i64::try_from(retention_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let is_stale = |conn: &DeviceConnection| {
            !conn.is_connected()
                && conn
                    .last_contact()
                    .timestamp_millis()
                    .saturating_add(retention_ms)
                    < now.timestamp_millis()
        };

        let candidates: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| is_stale(&entry.value().lock()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut pruned = 0;
        for device_id in candidates {
            let Entry::Vacant(_slot) = self.sessions.entry(device_id.clone()) else {
                continue;
            };
            if self
                .connections
                .remove_if(&device_id, |_, conn| is_stale(&conn.lock()))
                .is_some()
            {
                pruned += 1;
            }
        }

        if pruned > 0 {
            info!("Dropped {} stale connection records", pruned);
        }
        pruned
    }

    /// Record the asset a device resolved to
    pub fn set_asset_id(&self, device_id: &str, asset_id: Option<String>) -> bool {
        match self.connections.get(device_id) {
            Some(entry) => {
                entry.value().lock().set_asset_id(asset_id);
                true
            }
            None => false,
        }
    }

    fn connection_record(&self, device_id: &str, vendor_id: &str, realm: &str) -> SharedConnection {
        self.connections
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceConnection::new(vendor_id, device_id, realm).shared())
            .value()
            .clone()
    }

    fn snapshot<F>(&self, filter: F) -> Vec<Arc<DeviceSession>>
    where
        F: Fn(&DeviceSession) -> bool,
    {
        self.sessions
            .iter()
            .filter(|entry| filter(entry.value().as_ref()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Remove `candidate` only if the registry still maps its id to that same
    /// instance and it is still timed out at `now`
    fn remove_if_timed_out(
        &self,
        candidate: &Arc<DeviceSession>,
        timeout_secs: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let entry = self.sessions.remove_if(candidate.device_id(), |_, current| {
            Arc::ptr_eq(current, candidate) && current.is_timed_out_at(timeout_secs, now)
        });
        match entry {
            Some((_, session)) => {
                self.retire(&session, "timed out");
                true
            }
            None => false,
        }
    }

    fn notify_disconnected(&self, session: &Arc<DeviceSession>, failed: &[DeviceCommand]) {
        let listeners = self.listeners();
        for command in failed {
            for listener in &listeners {
                listener.on_command_failed(session, command);
            }
        }
        for listener in &listeners {
            listener.on_session_disconnected(session);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.read().clone()
    }

    fn retire(&self, session: &Arc<DeviceSession>, reason: &str) {
        session.retire();
        let failed = session.on_disconnect();
        info!(
            "Session for device {} {} after {} messages",
            session.device_id(),
            reason,
            session.message_count()
        );

        let listeners = self.listeners();
        for command in &failed {
            for listener in &listeners {
                listener.on_command_failed(session, command);
            }
        }
        for listener in &listeners {
            listener.on_session_removed(session);
        }
    }
}
