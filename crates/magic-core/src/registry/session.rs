//! Session Registry — ground truth for every authenticated client session.
//!
//! State machine:
//!
//! ```text
//!     CONNECTING ──auth ok──▶ AUTHENTICATED ──MCCR ok──▶ ACTIVE
//!         │                         │                      │
//!         │                         │                  link down
//!         │                         │                      ▼
//!         └──auth fail──▶ CLOSED ◀──────ack timeout── SUSPENDED
//!                                                         │
//!                                                     link up
//!                                                         ▼
//!                                                       ACTIVE
//! ```
//!
//! The ACTIVE→SUSPENDED transition is recorded here before the MNTR that
//! announces it goes out; the suspend operations return the post-mutation
//! snapshot for exactly that reason.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use magic_mih::BearerId;

use crate::error::RegistryError;
use crate::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Suspended,
    Closed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Authenticated => "AUTHENTICATED",
            SessionState::Active => "ACTIVE",
            SessionState::Suspended => "SUSPENDED",
            SessionState::Closed => "CLOSED",
        }
    }

    /// Legal edges of the lifecycle diagram.
    fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closed)
                | (Active, Active)
                | (Active, Suspended)
                | (Active, Closed)
                | (Suspended, Active)
                | (Suspended, Closed)
        )
    }
}

/// One client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub client_id: String,
    /// Stored at authentication time; never parsed out of client_id.
    pub client_realm: String,
    pub profile_name: String,
    pub state: SessionState,
    pub assigned_link: Option<String>,
    pub previous_link: Option<String>,
    pub bearer_id: Option<BearerId>,
    pub granted_bw_kbps: u32,
    pub granted_ret_bw_kbps: u32,
    /// The grant the policy originally made; restoration target after
    /// suspension or congestion.
    pub target_bw_kbps: u32,
    pub target_ret_bw_kbps: u32,
    pub qos_level: u32,
    pub priority_class: u32,
    pub gateway_ip: Option<Ipv4Addr>,
    /// 3-bit mask: bit 0 = magic-level, bit 1 = dlm-level.
    pub subscribed_status_level: u32,
    pub status_subscription_active: bool,
    pub last_activity: Instant,
    pub last_link_switch: Option<Instant>,
    /// Quality of the assigned link at grant time (available-bw percent).
    pub current_bw_percent: u32,
    pub last_notified_bw_kbps: Option<u32>,
    pub last_mntr_sent: Option<Instant>,
    pub mntr_pending_ack: bool,
}

impl Session {
    fn new(client_id: &str, client_realm: &str, profile_name: &str) -> Self {
        Session {
            session_id: ids::session_id(),
            client_id: client_id.to_owned(),
            client_realm: client_realm.to_owned(),
            profile_name: profile_name.to_owned(),
            state: SessionState::Connecting,
            assigned_link: None,
            previous_link: None,
            bearer_id: None,
            granted_bw_kbps: 0,
            granted_ret_bw_kbps: 0,
            target_bw_kbps: 0,
            target_ret_bw_kbps: 0,
            qos_level: 0,
            priority_class: 0,
            gateway_ip: None,
            subscribed_status_level: 0,
            status_subscription_active: false,
            last_activity: Instant::now(),
            last_link_switch: None,
            current_bw_percent: 0,
            last_notified_bw_kbps: None,
            last_mntr_sent: None,
            mntr_pending_ack: false,
        }
    }

    pub fn subscribed_magic_level(&self) -> bool {
        self.subscribed_status_level & 0b001 != 0
    }

    pub fn subscribed_dlm_level(&self) -> bool {
        self.subscribed_status_level & 0b010 != 0
    }
}

/// The Session Registry (SESS), sized to a fixed capacity.
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Session>>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        SessionRegistry {
            inner: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Create a session in CONNECTING. Fails past capacity.
    pub fn create(
        &self,
        client_id: &str,
        client_realm: &str,
        profile_name: &str,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        if sessions.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded);
        }
        let session = Session::new(client_id, client_realm, profile_name);
        sessions.insert(session.session_id.clone(), session.clone());
        debug!(session = %session.session_id, client = client_id, "session created");
        Ok(session)
    }

    /// Apply a state transition, enforcing the lifecycle diagram.
    /// An illegal transition is a programmer-level error: it is logged,
    /// the operation fails, and the session is left untouched.
    pub fn set_state(&self, session_id: &str, to: SessionState) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_owned()))?;
        if !session.state.can_transition_to(to) {
            error!(
                session = session_id,
                from = session.state.name(),
                to = to.name(),
                "invalid session state transition"
            );
            return Err(RegistryError::InvalidTransition {
                from: session.state.name(),
                to: to.name(),
            });
        }
        session.state = to;
        session.last_activity = Instant::now();
        Ok(session.clone())
    }

    pub fn lookup(&self, session_id: &str) -> Option<Session> {
        self.inner
            .lock()
            .expect("session registry lock")
            .get(session_id)
            .cloned()
    }

    pub fn find_by_client(&self, client_id: &str) -> Option<Session> {
        self.inner
            .lock()
            .expect("session registry lock")
            .values()
            .find(|s| s.client_id == client_id)
            .cloned()
    }

    /// Bind a session to a link and bearer with its grant, entering
    /// ACTIVE. `bw_percent` records the link quality used later by
    /// switch hysteresis.
    #[allow(clippy::too_many_arguments)]
    pub fn activate(
        &self,
        session_id: &str,
        profile_name: &str,
        link: &str,
        bearer_id: BearerId,
        granted_bw_kbps: u32,
        granted_ret_bw_kbps: u32,
        qos_level: u32,
        gateway_ip: Option<Ipv4Addr>,
        bw_percent: u32,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_owned()))?;
        if !session.state.can_transition_to(SessionState::Active) {
            return Err(RegistryError::InvalidTransition {
                from: session.state.name(),
                to: SessionState::Active.name(),
            });
        }
        session.profile_name = profile_name.to_owned();
        let switching = session.assigned_link.as_deref() != Some(link);
        if switching {
            session.previous_link = session.assigned_link.take();
            session.last_link_switch = Some(Instant::now());
        }
        session.assigned_link = Some(link.to_owned());
        session.bearer_id = Some(bearer_id);
        session.granted_bw_kbps = granted_bw_kbps;
        session.granted_ret_bw_kbps = granted_ret_bw_kbps;
        session.target_bw_kbps = granted_bw_kbps;
        session.target_ret_bw_kbps = granted_ret_bw_kbps;
        session.qos_level = qos_level;
        session.gateway_ip = gateway_ip;
        session.current_bw_percent = bw_percent;
        session.state = SessionState::Active;
        session.last_activity = Instant::now();
        Ok(session.clone())
    }

    /// Suspend an ACTIVE session: remember the grant, zero it, flip the
    /// state. The returned snapshot reflects the suspension — callers
    /// announce it only after this returns.
    pub fn suspend(&self, session_id: &str) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_owned()))?;
        if session.state != SessionState::Active {
            return Err(RegistryError::InvalidTransition {
                from: session.state.name(),
                to: SessionState::Suspended.name(),
            });
        }
        session.target_bw_kbps = session.target_bw_kbps.max(session.granted_bw_kbps);
        session.target_ret_bw_kbps = session.target_ret_bw_kbps.max(session.granted_ret_bw_kbps);
        session.granted_bw_kbps = 0;
        session.granted_ret_bw_kbps = 0;
        session.state = SessionState::Suspended;
        session.last_activity = Instant::now();
        info!(session = session_id, "session suspended");
        Ok(session.clone())
    }

    /// Resume a SUSPENDED session, restoring the remembered grant.
    pub fn resume(&self, session_id: &str) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_owned()))?;
        if session.state != SessionState::Suspended {
            return Err(RegistryError::InvalidTransition {
                from: session.state.name(),
                to: SessionState::Active.name(),
            });
        }
        session.granted_bw_kbps = session.target_bw_kbps;
        session.granted_ret_bw_kbps = session.target_ret_bw_kbps;
        session.state = SessionState::Active;
        session.last_activity = Instant::now();
        info!(session = session_id, restored_bw = session.granted_bw_kbps, "session resumed");
        Ok(session.clone())
    }

    /// Adjust the live grant (congestion or recovery on the serving link).
    pub fn update_grant(
        &self,
        session_id: &str,
        granted_bw_kbps: u32,
        granted_ret_bw_kbps: u32,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_owned()))?;
        session.granted_bw_kbps = granted_bw_kbps;
        session.granted_ret_bw_kbps = granted_ret_bw_kbps;
        session.last_activity = Instant::now();
        Ok(session.clone())
    }

    /// Set the status subscription level; level 0 unsubscribes.
    pub fn set_subscription(
        &self,
        session_id: &str,
        level: u32,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_owned()))?;
        session.subscribed_status_level = level & 0b111;
        session.status_subscription_active = session.subscribed_status_level != 0;
        session.last_activity = Instant::now();
        Ok(session.clone())
    }

    /// Remove the session (CLOSED is terminal). Returns the final
    /// snapshot so the caller can release its bearer.
    pub fn close(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.inner.lock().expect("session registry lock");
        let mut session = sessions.remove(session_id)?;
        session.state = SessionState::Closed;
        info!(session = session_id, client = %session.client_id, "session closed");
        Some(session)
    }

    /// All sessions with an active status subscription.
    pub fn find_subscribed(&self) -> Vec<Session> {
        self.inner
            .lock()
            .expect("session registry lock")
            .values()
            .filter(|s| s.status_subscription_active)
            .cloned()
            .collect()
    }

    /// All sessions bound to a link, any state.
    pub fn sessions_on_link(&self, link: &str) -> Vec<Session> {
        self.inner
            .lock()
            .expect("session registry lock")
            .values()
            .filter(|s| s.assigned_link.as_deref() == Some(link))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("session registry lock").len()
    }

    pub fn snapshot(&self) -> Vec<Session> {
        let sessions = self.inner.lock().expect("session registry lock");
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    /// Record an MNTR send on the session.
    pub fn mark_mntr_sent(&self, session_id: &str, notified_bw_kbps: u32) {
        let mut sessions = self.inner.lock().expect("session registry lock");
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_mntr_sent = Some(Instant::now());
            session.last_notified_bw_kbps = Some(notified_bw_kbps);
            session.mntr_pending_ack = true;
        }
    }

    /// Clear a pending-ack flag (MNTA arrived).
    pub fn ack_mntr(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.lock().expect("session registry lock");
        match sessions.get_mut(session_id) {
            Some(session) if session.mntr_pending_ack => {
                session.mntr_pending_ack = false;
                session.last_activity = Instant::now();
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    /// Undo pending-ack bookkeeping after a failed send.
    pub fn clear_pending_ack(&self, session_id: &str) {
        let mut sessions = self.inner.lock().expect("session registry lock");
        if let Some(session) = sessions.get_mut(session_id) {
            session.mntr_pending_ack = false;
        }
    }

    /// Force-close every session whose MNTR has waited longer than
    /// `timeout` for its ack. Returns the closed sessions.
    pub fn sweep_ack_timeouts(&self, timeout: Duration) -> Vec<Session> {
        let now = Instant::now();
        let mut sessions = self.inner.lock().expect("session registry lock");
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| {
                s.mntr_pending_ack
                    && s.last_mntr_sent
                        .map(|at| now.duration_since(at) >= timeout)
                        .unwrap_or(false)
            })
            .map(|s| s.session_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                let mut session = sessions.remove(&id)?;
                warn!(session = %id, "MNTR ack timeout, force-closing session");
                session.state = SessionState::Closed;
                Some(session)
            })
            .collect()
    }
}
