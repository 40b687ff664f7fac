//! Link Registry — ground truth for what links exist, what they can do,
//! and how they are doing right now.
//!
//! All mutation happens under one mutex. Events fan out on a broadcast
//! channel and are always sent after the lock is released, so a
//! subscriber can re-enter the registry without deadlock. For any one
//! link, the order of UP/DOWN events on the channel matches the order the
//! transitions were applied.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use magic_mih::{
    BearerId, HealthStatus, LinkCapabilities, LinkDownReason, LinkParameters, LinkType, QosParam,
    MAX_BEARERS,
};

use crate::config::Config;
use crate::error::RegistryError;

/// A logical channel on a link with its own QoS contract.
#[derive(Debug, Clone)]
pub struct Bearer {
    pub id: BearerId,
    pub qos: QosParam,
    pub created_at: Instant,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// One registered DLM / link.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub name: String,
    pub link_type: LinkType,
    pub attach_point: String,
    pub assigned_id: u32,
    pub dlm_pid: u32,
    pub link_up: bool,
    pub capabilities: LinkCapabilities,
    pub params: LinkParameters,
    pub bearers: [Option<Bearer>; MAX_BEARERS],
    pub subscribed_events: u16,
    pub last_heartbeat: Instant,
    pub last_seen: Instant,
}

impl LinkEntry {
    pub fn active_bearer_count(&self) -> usize {
        self.bearers.iter().filter(|b| b.is_some()).count()
    }

    /// Available forward bandwidth as a percentage of the link's maximum,
    /// the quality metric used by switch hysteresis.
    pub fn available_bw_percent(&self) -> u32 {
        if self.capabilities.max_bandwidth_kbps == 0 {
            return 0;
        }
        let pct =
            self.params.available_bw_kbps as u64 * 100 / self.capabilities.max_bandwidth_kbps as u64;
        pct.min(100) as u32
    }

    /// Sum of forward rates granted to active bearers, kbps.
    pub fn allocated_forward_kbps(&self) -> u32 {
        self.bearers
            .iter()
            .flatten()
            .map(|b| b.qos.forward_rate_kbps)
            .sum()
    }

    pub fn allocated_return_kbps(&self) -> u32 {
        self.bearers
            .iter()
            .flatten()
            .map(|b| b.qos.return_rate_kbps)
            .sum()
    }
}

/// Registry event, observed by the push engine and the south transports.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Up {
        link: String,
    },
    Down {
        link: String,
        reason: LinkDownReason,
        text: String,
    },
    GoingDown {
        link: String,
        time_to_down_ms: u32,
        reason: LinkDownReason,
    },
    Detected {
        link: String,
    },
    ParamReport {
        link: String,
        params: LinkParameters,
    },
}

struct Table {
    entries: HashMap<String, LinkEntry>,
    next_assigned_id: u32,
}

/// The Link Registry (LMI).
pub struct LinkRegistry {
    inner: Mutex<Table>,
    events: broadcast::Sender<LinkEvent>,
    catalog: Vec<String>,
    capacity: usize,
}

impl LinkRegistry {
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(256);
        LinkRegistry {
            inner: Mutex::new(Table {
                entries: HashMap::new(),
                next_assigned_id: 1,
            }),
            events,
            catalog: config.datalinks.iter().map(|d| d.name.clone()).collect(),
            capacity: config.core.max_dlm_clients,
        }
    }

    /// Subscribe to link events. Multiple subscribers are allowed.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LinkEvent) {
        // Send errors just mean nobody is listening.
        let _ = self.events.send(event);
    }

    /// Register a DLM for a catalogued link.
    pub fn register(
        &self,
        name: &str,
        link_type: LinkType,
        attach_point: &str,
        capabilities: LinkCapabilities,
        dlm_pid: u32,
    ) -> Result<u32, RegistryError> {
        capabilities
            .validate()
            .map_err(RegistryError::InvalidCapabilities)?;
        if !self.catalog.iter().any(|n| n == name) {
            return Err(RegistryError::NotInCatalog(name.to_owned()));
        }
        let assigned_id = {
            let mut table = self.inner.lock().expect("link registry lock");
            if table.entries.contains_key(name) {
                return Err(RegistryError::AlreadyRegistered(name.to_owned()));
            }
            if table.entries.len() >= self.capacity {
                return Err(RegistryError::CapacityExceeded);
            }
            let assigned_id = table.next_assigned_id;
            table.next_assigned_id += 1;
            let now = Instant::now();
            table.entries.insert(
                name.to_owned(),
                LinkEntry {
                    name: name.to_owned(),
                    link_type,
                    attach_point: attach_point.to_owned(),
                    assigned_id,
                    dlm_pid,
                    link_up: false,
                    capabilities,
                    params: LinkParameters::default(),
                    bearers: Default::default(),
                    subscribed_events: 0,
                    last_heartbeat: now,
                    last_seen: now,
                },
            );
            assigned_id
        };
        info!(link = name, %link_type, assigned_id, dlm_pid, "DLM registered");
        Ok(assigned_id)
    }

    /// Mark a link up. The first UP wins; a repeated UP on an already-up
    /// link is treated as a heartbeat. Returns whether the link was newly
    /// brought up.
    pub fn mark_up(
        &self,
        name: &str,
        initial_params: LinkParameters,
    ) -> Result<bool, RegistryError> {
        let newly_up = {
            let mut table = self.inner.lock().expect("link registry lock");
            let entry = table
                .entries
                .get_mut(name)
                .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
            let now = Instant::now();
            entry.last_seen = now;
            entry.last_heartbeat = now;
            if entry.link_up {
                false
            } else {
                entry.link_up = true;
                entry.params = initial_params;
                true
            }
        };
        if newly_up {
            info!(link = name, "link up");
            self.emit(LinkEvent::Up {
                link: name.to_owned(),
            });
        } else {
            debug!(link = name, "repeated link-up treated as heartbeat");
        }
        Ok(newly_up)
    }

    /// Mark a link down. The entry stays registered; its bearers are kept
    /// so suspended sessions can resume on recovery.
    pub fn mark_down(
        &self,
        name: &str,
        reason: LinkDownReason,
        text: &str,
    ) -> Result<bool, RegistryError> {
        let newly_down = {
            let mut table = self.inner.lock().expect("link registry lock");
            let entry = table
                .entries
                .get_mut(name)
                .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
            entry.last_seen = Instant::now();
            if entry.link_up {
                entry.link_up = false;
                entry.params.available_bw_kbps = 0;
                true
            } else {
                false
            }
        };
        if newly_down {
            warn!(link = name, %reason, text, "link down");
            self.emit(LinkEvent::Down {
                link: name.to_owned(),
                reason,
                text: text.to_owned(),
            });
        }
        Ok(newly_down)
    }

    /// Remove a registration entirely (transport close, explicit
    /// disconnect, liveness timeout). Bearers die with the entry. Fires
    /// DOWN if the link was up.
    pub fn remove(&self, name: &str, reason: LinkDownReason, text: &str) -> bool {
        let removed = {
            let mut table = self.inner.lock().expect("link registry lock");
            table.entries.remove(name)
        };
        match removed {
            Some(entry) => {
                info!(link = name, %reason, "DLM removed from registry");
                if entry.link_up {
                    self.emit(LinkEvent::Down {
                        link: name.to_owned(),
                        reason,
                        text: text.to_owned(),
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Last-writer-wins parameter update. A report for a down link is an
    /// implicit UP.
    pub fn update_parameters(
        &self,
        name: &str,
        params: LinkParameters,
    ) -> Result<(), RegistryError> {
        let implicit_up = {
            let mut table = self.inner.lock().expect("link registry lock");
            let entry = table
                .entries
                .get_mut(name)
                .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
            let now = Instant::now();
            entry.last_seen = now;
            let implicit_up = !entry.link_up;
            if implicit_up {
                entry.link_up = true;
                entry.last_heartbeat = now;
            }
            let active = entry.active_bearer_count() as u16;
            entry.params = params;
            // The bearer table is authoritative for the active count.
            entry.params.active_bearers = active;
            implicit_up
        };
        if implicit_up {
            info!(link = name, "parameter report for down link, implicit up");
            self.emit(LinkEvent::Up {
                link: name.to_owned(),
            });
        }
        self.emit(LinkEvent::ParamReport {
            link: name.to_owned(),
            params,
        });
        Ok(())
    }

    pub fn update_capabilities(
        &self,
        name: &str,
        capabilities: LinkCapabilities,
    ) -> Result<(), RegistryError> {
        capabilities
            .validate()
            .map_err(RegistryError::InvalidCapabilities)?;
        let mut table = self.inner.lock().expect("link registry lock");
        let entry = table
            .entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
        entry.capabilities = capabilities;
        entry.last_seen = Instant::now();
        Ok(())
    }

    /// Early-warning pass-through.
    pub fn going_down(
        &self,
        name: &str,
        time_to_down_ms: u32,
        reason: LinkDownReason,
    ) -> Result<(), RegistryError> {
        {
            let mut table = self.inner.lock().expect("link registry lock");
            let entry = table
                .entries
                .get_mut(name)
                .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
            entry.last_seen = Instant::now();
        }
        warn!(link = name, time_to_down_ms, %reason, "link going down");
        self.emit(LinkEvent::GoingDown {
            link: name.to_owned(),
            time_to_down_ms,
            reason,
        });
        Ok(())
    }

    /// A new link was detected. Links outside the catalog are ignored.
    pub fn detected(&self, name: &str) {
        if self.catalog.iter().any(|n| n == name) {
            self.emit(LinkEvent::Detected {
                link: name.to_owned(),
            });
        } else {
            debug!(link = name, "detected link not in catalog, ignoring");
        }
    }

    /// Allocate the lowest free bearer slot on a link.
    pub fn allocate_bearer(&self, name: &str, qos: QosParam) -> Result<BearerId, RegistryError> {
        qos.validate().map_err(RegistryError::QosNotSupported)?;
        let mut table = self.inner.lock().expect("link registry lock");
        let entry = table
            .entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
        let slot = entry
            .bearers
            .iter()
            .position(|b| b.is_none())
            .ok_or(RegistryError::NoFreeBearer)?;
        let id = (slot + 1) as BearerId;
        entry.bearers[slot] = Some(Bearer {
            id,
            qos,
            created_at: Instant::now(),
            tx_bytes: 0,
            rx_bytes: 0,
        });
        entry.params.active_bearers = entry.active_bearer_count() as u16;
        debug!(link = name, bearer = id, fwd = qos.forward_rate_kbps, "bearer allocated");
        Ok(id)
    }

    /// Release a bearer; the id becomes reusable.
    pub fn release_bearer(&self, name: &str, bearer_id: BearerId) -> Result<(), RegistryError> {
        let mut table = self.inner.lock().expect("link registry lock");
        let entry = table
            .entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
        if bearer_id == 0 || bearer_id as usize > MAX_BEARERS {
            return Err(RegistryError::InvalidBearer(bearer_id));
        }
        let slot = (bearer_id - 1) as usize;
        if entry.bearers[slot].take().is_none() {
            return Err(RegistryError::InvalidBearer(bearer_id));
        }
        entry.params.active_bearers = entry.active_bearer_count() as u16;
        debug!(link = name, bearer = bearer_id, "bearer released");
        Ok(())
    }

    /// Record a heartbeat. WARNING/ERROR health is logged loudly.
    pub fn heartbeat(&self, name: &str, health: HealthStatus) -> Result<(), RegistryError> {
        {
            let mut table = self.inner.lock().expect("link registry lock");
            let entry = table
                .entries
                .get_mut(name)
                .ok_or_else(|| RegistryError::LinkNotFound(name.to_owned()))?;
            let now = Instant::now();
            entry.last_heartbeat = now;
            entry.last_seen = now;
        }
        match health {
            HealthStatus::Ok => debug!(link = name, "heartbeat"),
            HealthStatus::Warning => warn!(link = name, "heartbeat with WARNING health"),
            HealthStatus::Error => warn!(link = name, "heartbeat with ERROR health"),
        }
        Ok(())
    }

    /// Implicit keep-alive for the datagram and UDP paths.
    pub fn touch(&self, name: &str) {
        let mut table = self.inner.lock().expect("link registry lock");
        if let Some(entry) = table.entries.get_mut(name) {
            entry.last_seen = Instant::now();
        }
    }

    pub fn find(&self, name: &str) -> Option<LinkEntry> {
        self.inner
            .lock()
            .expect("link registry lock")
            .entries
            .get(name)
            .cloned()
    }

    /// Snapshot of every registered link, sorted by name for stable
    /// iteration.
    pub fn snapshot(&self) -> Vec<LinkEntry> {
        let table = self.inner.lock().expect("link registry lock");
        let mut entries: Vec<LinkEntry> = table.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("link registry lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every link whose last_seen is older than `timeout`, firing
    /// DOWN with reason=timeout for each. Returns the removed names.
    pub fn sweep_expired(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<(String, bool)> = {
            let mut table = self.inner.lock().expect("link registry lock");
            let names: Vec<String> = table
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_seen) >= timeout)
                .map(|(n, _)| n.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|n| table.entries.remove(&n).map(|e| (n, e.link_up)))
                .collect()
        };
        let mut removed = Vec::with_capacity(expired.len());
        for (name, was_up) in expired {
            warn!(link = %name, "heartbeat timeout, clearing registry entry");
            if was_up {
                self.emit(LinkEvent::Down {
                    link: name.clone(),
                    reason: LinkDownReason::Timeout,
                    text: "heartbeat timeout".into(),
                });
            }
            removed.push(name);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [[datalinks]]
            name = "SATCOM"
            link_type = "satcom-ku"
            max_forward_bw_kbps = 30000
            latency_ms = 600

            [[datalinks]]
            name = "CELLULAR"
            link_type = "lte"
            max_forward_bw_kbps = 50000
            latency_ms = 50
            "#,
        )
        .unwrap()
    }

    fn caps() -> LinkCapabilities {
        LinkCapabilities {
            max_bandwidth_kbps: 30_000,
            typical_latency_ms: 600,
            cost_per_mb: 50,
            coverage: 1,
            security_level: 3,
            mtu: 1500,
            is_asymmetric: true,
        }
    }

    fn qos(fwd: u32) -> QosParam {
        QosParam {
            forward_rate_kbps: fwd,
            ..QosParam::default()
        }
    }

    #[test]
    fn register_enforces_catalog() {
        let reg = LinkRegistry::new(&test_config());
        assert_eq!(
            reg.register("MYSTERY", LinkType::Wifi80211, "wl0", caps(), 1),
            Err(RegistryError::NotInCatalog("MYSTERY".into()))
        );
        assert!(reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).is_ok());
        assert_eq!(
            reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1),
            Err(RegistryError::AlreadyRegistered("SATCOM".into()))
        );
    }

    #[test]
    fn register_rejects_bad_capabilities() {
        let reg = LinkRegistry::new(&test_config());
        let bad = LinkCapabilities {
            security_level: 0,
            ..caps()
        };
        assert!(matches!(
            reg.register("SATCOM", LinkType::SatcomKu, "sat0", bad, 1),
            Err(RegistryError::InvalidCapabilities(_))
        ));
    }

    #[test]
    fn double_up_is_idempotent() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        assert!(reg.mark_up("SATCOM", LinkParameters::default()).unwrap());
        assert!(!reg.mark_up("SATCOM", LinkParameters::default()).unwrap());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn bearer_ids_are_lowest_free_and_reused() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();

        let b1 = reg.allocate_bearer("SATCOM", qos(100)).unwrap();
        let b2 = reg.allocate_bearer("SATCOM", qos(100)).unwrap();
        let b3 = reg.allocate_bearer("SATCOM", qos(100)).unwrap();
        assert_eq!((b1, b2, b3), (1, 2, 3));

        reg.release_bearer("SATCOM", 2).unwrap();
        let again = reg.allocate_bearer("SATCOM", qos(100)).unwrap();
        assert_eq!(again, 2, "released id is reused, not 4");
    }

    #[test]
    fn bearer_table_capacity() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        for _ in 0..MAX_BEARERS {
            reg.allocate_bearer("SATCOM", qos(10)).unwrap();
        }
        assert_eq!(
            reg.allocate_bearer("SATCOM", qos(10)),
            Err(RegistryError::NoFreeBearer)
        );
    }

    #[test]
    fn release_validates_id() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        assert_eq!(
            reg.release_bearer("SATCOM", 0),
            Err(RegistryError::InvalidBearer(0))
        );
        assert_eq!(
            reg.release_bearer("SATCOM", (MAX_BEARERS + 1) as u8),
            Err(RegistryError::InvalidBearer((MAX_BEARERS + 1) as u8))
        );
        assert_eq!(
            reg.release_bearer("SATCOM", 1),
            Err(RegistryError::InvalidBearer(1))
        );
    }

    #[test]
    fn qos_validated_before_allocation() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        assert!(matches!(
            reg.allocate_bearer("SATCOM", QosParam::default()),
            Err(RegistryError::QosNotSupported(_))
        ));
        // Failed allocation must not consume a slot.
        assert_eq!(reg.allocate_bearer("SATCOM", qos(10)).unwrap(), 1);
    }

    #[test]
    fn active_bearer_count_tracks_table() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        reg.allocate_bearer("SATCOM", qos(10)).unwrap();
        reg.allocate_bearer("SATCOM", qos(10)).unwrap();
        let entry = reg.find("SATCOM").unwrap();
        assert_eq!(entry.active_bearer_count(), 2);
        assert_eq!(entry.params.active_bearers, 2);

        reg.release_bearer("SATCOM", 1).unwrap();
        let entry = reg.find("SATCOM").unwrap();
        assert_eq!(entry.params.active_bearers, 1);
    }

    #[test]
    fn param_report_is_implicit_up() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        let mut rx = reg.subscribe();
        reg.update_parameters("SATCOM", LinkParameters::default()).unwrap();
        assert!(reg.find("SATCOM").unwrap().link_up);
        assert!(matches!(rx.try_recv().unwrap(), LinkEvent::Up { .. }));
        assert!(matches!(rx.try_recv().unwrap(), LinkEvent::ParamReport { .. }));
    }

    #[test]
    fn down_keeps_bearers_for_resume() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        reg.mark_up("SATCOM", LinkParameters::default()).unwrap();
        reg.allocate_bearer("SATCOM", qos(10)).unwrap();
        reg.mark_down("SATCOM", LinkDownReason::SignalLoss, "fade").unwrap();
        let entry = reg.find("SATCOM").unwrap();
        assert!(!entry.link_up);
        assert_eq!(entry.active_bearer_count(), 1);
    }

    #[test]
    fn sweep_removes_stale_and_fires_down() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        reg.mark_up("SATCOM", LinkParameters::default()).unwrap();
        let mut rx = reg.subscribe();

        // Nothing is stale against the real timeout.
        assert!(reg.sweep_expired(Duration::from_secs(30)).is_empty());

        // A zero timeout expires everything.
        let removed = reg.sweep_expired(Duration::ZERO);
        assert_eq!(removed, vec!["SATCOM".to_string()]);
        assert!(reg.is_empty());
        match rx.try_recv().unwrap() {
            LinkEvent::Down { link, reason, .. } => {
                assert_eq!(link, "SATCOM");
                assert_eq!(reason, LinkDownReason::Timeout);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn capability_updates_are_last_writer_wins() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        let updated = LinkCapabilities {
            max_bandwidth_kbps: 45_000,
            ..caps()
        };
        reg.update_capabilities("SATCOM", updated).unwrap();
        assert_eq!(
            reg.find("SATCOM").unwrap().capabilities.max_bandwidth_kbps,
            45_000
        );
        assert!(matches!(
            reg.update_capabilities("SATCOM", LinkCapabilities { security_level: 9, ..caps() }),
            Err(RegistryError::InvalidCapabilities(_))
        ));
    }

    #[test]
    fn capacity_cap() {
        let mut config = test_config();
        config.core.max_dlm_clients = 1;
        let reg = LinkRegistry::new(&config);
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        assert_eq!(
            reg.register("CELLULAR", LinkType::LteFdd, "wwan0", caps(), 2),
            Err(RegistryError::CapacityExceeded)
        );
    }

    #[test]
    fn available_bw_percent() {
        let reg = LinkRegistry::new(&test_config());
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", caps(), 1).unwrap();
        let params = LinkParameters {
            available_bw_kbps: 15_000,
            ..LinkParameters::default()
        };
        reg.update_parameters("SATCOM", params).unwrap();
        assert_eq!(reg.find("SATCOM").unwrap().available_bw_percent(), 50);
    }
}
