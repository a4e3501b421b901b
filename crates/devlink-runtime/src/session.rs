//! Session directory.
//!
//! Tracks every known device session, which one is active, and when each
//! was last heard from. The directory is created by the shell at startup and
//! dropped at shutdown; only the transport and the provisioning driver
//! mutate it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use devlink_core::{
    ConfigStorage, ConnectionState, DeviceId, DeviceSession, Endpoint, LastSession,
};

#[derive(Default)]
struct Directory {
    sessions: BTreeMap<DeviceId, DeviceSession>,
    active: Option<DeviceId>,
}

/// Known device sessions and the active one.
pub struct SessionDirectory {
    inner: RwLock<Directory>,
    storage: Arc<dyn ConfigStorage>,
    expiry: Duration,
}

impl SessionDirectory {
    pub fn new(storage: Arc<dyn ConfigStorage>, expiry: Duration) -> Self {
        Self {
            inner: RwLock::new(Directory::default()),
            storage,
            expiry,
        }
    }

    /// All known sessions, ordered by device id.
    pub fn sessions(&self) -> Vec<DeviceSession> {
        self.read().sessions.values().cloned().collect()
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceSession> {
        self.read().sessions.get(id).cloned()
    }

    pub fn active(&self) -> Option<DeviceSession> {
        let dir = self.read();
        dir.active.as_ref().and_then(|id| dir.sessions.get(id)).cloned()
    }

    pub fn active_id(&self) -> Option<DeviceId> {
        self.read().active.clone()
    }

    /// The persisted last-selected session, if any.
    pub fn last_selected(&self) -> Option<LastSession> {
        match self.storage.load_last_session() {
            Ok(last) => last,
            Err(e) => {
                warn!("Failed to load last session: {}", e);
                None
            }
        }
    }

    /// Record a device found by portal probing. Known sessions keep their
    /// endpoint and only get their heartbeat refreshed.
    pub(crate) fn discovered(&self, id: DeviceId, endpoint: Endpoint) -> DeviceSession {
        let mut dir = self.write();
        let session = dir
            .sessions
            .entry(id.clone())
            .and_modify(|s| s.last_seen = Utc::now())
            .or_insert_with(|| {
                debug!("Discovered device {} at {}", id, endpoint);
                DeviceSession::new(id, endpoint)
            });
        session.clone()
    }

    /// Make `id` the active session and persist it as the last selection.
    ///
    /// Any other inactive session reached through the same endpoint is a
    /// provisional entry created before the device reported its real id and
    /// is removed.
    pub(crate) fn activate(&self, id: &DeviceId, endpoint: &Endpoint) {
        {
            let mut dir = self.write();
            dir.sessions
                .retain(|other, s| other == id || &s.endpoint != endpoint);
            let session = dir
                .sessions
                .entry(id.clone())
                .or_insert_with(|| DeviceSession::new(id.clone(), endpoint.clone()));
            session.endpoint = endpoint.clone();
            session.last_seen = Utc::now();
            dir.active = Some(id.clone());
        }
        info!("Active device is now {}", id);
        self.persist(id, endpoint);
    }

    /// Clear the active marker. The session stays known.
    pub(crate) fn deactivate(&self) {
        let mut dir = self.write();
        let Some(id) = dir.active.take() else {
            return;
        };
        if let Some(session) = dir.sessions.get_mut(&id) {
            session.link = ConnectionState::Disconnected;
        }
    }

    /// Destroy the active session. The persisted last selection is kept so
    /// the device can be reconnected on the next start.
    pub(crate) fn close(&self) -> Option<DeviceId> {
        let mut dir = self.write();
        let id = dir.active.take()?;
        dir.sessions.remove(&id);
        debug!("Session {} closed", id);
        Some(id)
    }

    /// Remove a session. If it is the persisted selection, that is cleared
    /// as well.
    pub(crate) fn forget(&self, id: &DeviceId) {
        {
            let mut dir = self.write();
            if dir.active.as_ref() == Some(id) {
                dir.active = None;
            }
            dir.sessions.remove(id);
        }
        let persisted = self.last_selected().map(|last| &last.device_id == id);
        if persisted.unwrap_or(false) {
            if let Err(e) = self.storage.clear_last_session() {
                warn!("Failed to clear last session: {}", e);
            }
        }
        info!("Forgot device {}", id);
    }

    pub(crate) fn set_link(&self, id: &DeviceId, link: ConnectionState) {
        if let Some(session) = self.write().sessions.get_mut(id) {
            session.link = link;
        }
    }

    /// Heartbeat: the device was heard from.
    pub(crate) fn touch(&self, id: &DeviceId) {
        if let Some(session) = self.write().sessions.get_mut(id) {
            session.last_seen = Utc::now();
        }
    }

    /// Point a session at a new endpoint, e.g. after the device joined the
    /// user's network and left portal mode.
    pub(crate) fn update_endpoint(&self, id: &DeviceId, endpoint: Endpoint) {
        let is_active = {
            let mut dir = self.write();
            let Some(session) = dir.sessions.get_mut(id) else {
                return;
            };
            session.via_portal = false;
            session.endpoint = endpoint.clone();
            dir.active.as_ref() == Some(id)
        };
        info!("Device {} now reachable at {}", id, endpoint);
        if is_active {
            self.persist(id, &endpoint);
        }
    }

    /// Remove sessions not heard from within the expiry window.
    ///
    /// The active session only expires once its link is `Unreachable`; the
    /// active marker is cleared with it.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<DeviceId> {
        let expiry = chrono::Duration::from_std(self.expiry)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut dir = self.write();
        let active = dir.active.clone();

        let expired: Vec<DeviceId> = dir
            .sessions
            .values()
            .filter(|s| Some(&s.id) != active.as_ref() || s.link == ConnectionState::Unreachable)
            .filter(|s| now - s.last_seen > expiry)
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            dir.sessions.remove(id);
            if dir.active.as_ref() == Some(id) {
                dir.active = None;
            }
            debug!("Session {} expired", id);
        }
        expired
    }

    fn persist(&self, id: &DeviceId, endpoint: &Endpoint) {
        let last = LastSession {
            device_id: id.clone(),
            endpoint: endpoint.clone(),
            saved_at: Utc::now(),
        };
        if let Err(e) = self.storage.save_last_session(&last) {
            warn!("Failed to persist last session: {}", e);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Directory> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Directory> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_core::MemoryConfigStorage;

    fn directory() -> (SessionDirectory, Arc<MemoryConfigStorage>) {
        let storage = Arc::new(MemoryConfigStorage::new());
        let dir = SessionDirectory::new(storage.clone(), Duration::from_secs(60));
        (dir, storage)
    }

    #[test]
    fn test_activate_persists_selection() {
        let (dir, storage) = directory();
        let id = DeviceId::new("esp32m-1a2b");
        let endpoint = Endpoint::direct("ws://10.0.0.5/ws");

        dir.activate(&id, &endpoint);

        assert_eq!(dir.active_id(), Some(id.clone()));
        let last = storage.load_last_session().unwrap().unwrap();
        assert_eq!(last.device_id, id);
        assert_eq!(last.endpoint, endpoint);
        assert_eq!(dir.last_selected().unwrap().device_id, id);
    }

    #[test]
    fn test_activate_replaces_provisional_entry() {
        let (dir, _) = directory();
        let endpoint = Endpoint::captive("esp32m-1a2b", "ws://192.168.4.1/ws");
        dir.discovered(DeviceId::new("esp32m-1a2b"), endpoint.clone());

        let real = DeviceId::new("a4cf12-1a2b");
        dir.activate(&real, &endpoint);

        let sessions = dir.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, real);
    }

    #[test]
    fn test_at_most_one_active() {
        let (dir, _) = directory();
        let a = DeviceId::new("a");
        let b = DeviceId::new("b");
        dir.activate(&a, &Endpoint::direct("ws://10.0.0.1/ws"));
        dir.activate(&b, &Endpoint::direct("ws://10.0.0.2/ws"));

        assert_eq!(dir.active().unwrap().id, b);
        assert_eq!(dir.sessions().len(), 2);
    }

    #[test]
    fn test_deactivate_and_forget() {
        let (dir, storage) = directory();
        let id = DeviceId::new("a");
        dir.activate(&id, &Endpoint::direct("ws://10.0.0.1/ws"));

        dir.deactivate();
        assert!(dir.active().is_none());
        assert!(dir.get(&id).is_some());
        assert!(storage.load_last_session().unwrap().is_some());

        dir.forget(&id);
        assert!(dir.get(&id).is_none());
        assert!(storage.load_last_session().unwrap().is_none());
    }

    #[test]
    fn test_expire_stale_keeps_active() {
        let (dir, _) = directory();
        let active = DeviceId::new("active");
        let idle = DeviceId::new("idle");
        dir.activate(&active, &Endpoint::direct("ws://10.0.0.1/ws"));
        dir.discovered(idle.clone(), Endpoint::captive("esp32m-idle", "ws://192.168.4.1/ws"));

        assert!(dir.expire_stale(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(dir.expire_stale(later), vec![idle]);
        assert!(dir.get(&active).is_some());
    }

    #[test]
    fn test_unreachable_active_session_expires() {
        let (dir, storage) = directory();
        let id = DeviceId::new("active");
        dir.activate(&id, &Endpoint::direct("ws://10.0.0.1/ws"));
        let later = Utc::now() + chrono::Duration::seconds(120);

        dir.set_link(&id, ConnectionState::Reconnecting { attempt: 3 });
        assert!(dir.expire_stale(later).is_empty());

        dir.set_link(&id, ConnectionState::Unreachable);
        assert!(dir.expire_stale(Utc::now()).is_empty());
        assert_eq!(dir.expire_stale(later), vec![id.clone()]);
        assert!(dir.active_id().is_none());
        assert!(dir.sessions().is_empty());
        assert_eq!(storage.load_last_session().unwrap().unwrap().device_id, id);
    }

    #[test]
    fn test_close_removes_active_keeps_selection() {
        let (dir, storage) = directory();
        let id = DeviceId::new("a");
        dir.activate(&id, &Endpoint::direct("ws://10.0.0.1/ws"));

        assert_eq!(dir.close(), Some(id.clone()));
        assert!(dir.active_id().is_none());
        assert!(dir.get(&id).is_none());
        assert_eq!(dir.last_selected().unwrap().device_id, id);
        assert!(storage.load_last_session().unwrap().is_some());

        assert_eq!(dir.close(), None);
    }

    #[test]
    fn test_update_endpoint() {
        let (dir, storage) = directory();
        let id = DeviceId::new("a");
        dir.activate(&id, &Endpoint::captive("esp32m-a", "ws://192.168.4.1/ws"));

        dir.update_endpoint(&id, Endpoint::direct("ws://10.0.0.9/ws"));

        let session = dir.get(&id).unwrap();
        assert!(!session.via_portal);
        assert_eq!(session.endpoint.url(), "ws://10.0.0.9/ws");
        let last = storage.load_last_session().unwrap().unwrap();
        assert_eq!(last.endpoint, Endpoint::direct("ws://10.0.0.9/ws"));
    }
}
