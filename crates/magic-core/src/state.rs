//! Shared daemon state.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use magic_proto::Message;

use crate::adif::AdifState;
use crate::config::Config;
use crate::registry::{LinkRegistry, SessionRegistry};

/// Outbound handle to one connected client, keyed by session id.
pub struct ClientHandle {
    /// Channel into the connection's writer task, carrying fully lowered
    /// wire messages.
    pub tx: mpsc::Sender<Message>,
}

/// Push-engine counters, reported in the status dump.
#[derive(Debug, Default)]
pub struct PushCounters {
    pub mntr_sent: AtomicU64,
    pub mntr_suppressed: AtomicU64,
    pub mntr_failed: AtomicU64,
    pub mscr_sent: AtomicU64,
}

/// State shared across every task. Cheap to clone.
#[derive(Clone)]
pub struct CoreState {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    links: LinkRegistry,
    sessions: SessionRegistry,
    adif: AdifState,
    /// Connected clients by session id (the push engine's send targets).
    clients: DashMap<String, ClientHandle>,
    counters: PushCounters,
    /// Pairing ids for server-initiated requests (MNTR, MSCR).
    pairing: AtomicU32,
}

impl CoreState {
    pub fn new(config: Config) -> Self {
        let links = LinkRegistry::new(&config);
        let sessions = SessionRegistry::new(config.core.max_sessions);
        CoreState {
            inner: Arc::new(Inner {
                links,
                sessions,
                adif: AdifState::new(),
                clients: DashMap::new(),
                counters: PushCounters::default(),
                pairing: AtomicU32::new(1),
                config,
            }),
        }
    }

    /// Fresh hop-by-hop / end-to-end pair for a server-initiated request.
    pub fn next_pairing(&self) -> (u32, u32) {
        let id = self.inner.pairing.fetch_add(1, Ordering::Relaxed);
        (id, id)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.inner.links
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn adif(&self) -> &AdifState {
        &self.inner.adif
    }

    pub fn clients(&self) -> &DashMap<String, ClientHandle> {
        &self.inner.clients
    }

    pub fn counters(&self) -> &PushCounters {
        &self.inner.counters
    }

    /// Log a full state snapshot (the SIGUSR1 handler).
    pub fn status_dump(&self) {
        let links = self.links().snapshot();
        let sessions = self.sessions().snapshot();
        info!(
            links = links.len(),
            sessions = sessions.len(),
            connected_clients = self.clients().len(),
            "status dump"
        );
        for link in &links {
            info!(
                link = %link.name,
                link_type = %link.link_type,
                up = link.link_up,
                bearers = link.active_bearer_count(),
                available_kbps = link.params.available_bw_kbps,
                signal_dbm = link.params.signal_dbm,
                "  link"
            );
        }
        for session in &sessions {
            info!(
                session = %session.session_id,
                client = %session.client_id,
                state = session.state.name(),
                link = session.assigned_link.as_deref().unwrap_or("-"),
                granted_kbps = session.granted_bw_kbps,
                subscription = session.subscribed_status_level,
                "  session"
            );
        }
        let c = self.counters();
        info!(
            mntr_sent = c.mntr_sent.load(Ordering::Relaxed),
            mntr_suppressed = c.mntr_suppressed.load(Ordering::Relaxed),
            mntr_failed = c.mntr_failed.load(Ordering::Relaxed),
            mscr_sent = c.mscr_sent.load(Ordering::Relaxed),
            "  push counters"
        );
    }
}
