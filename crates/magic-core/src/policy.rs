//! Policy engine: one pure function from request + registry snapshot +
//! configuration to a link choice and grant, or a typed denial.
//!
//! Two calls with the same request and the same snapshot return the same
//! decision. The engine never touches a registry itself.

use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::adif::AdifSnapshot;
use crate::config::{
    Config, CoverageConfig, PathPreference, PolicyRule, PreferenceAction, SwitchingSection,
};
use crate::registry::{LinkEntry, Session};

const METERS_TO_FEET: f64 = 3.28084;
/// Score assigned to a preference that failed a hard constraint.
const REJECTED: i64 = i64::MIN;

/// The inputs the engine consumes from an MCCR.
#[derive(Debug, Clone)]
pub struct PolicyRequest<'a> {
    pub client_id: &'a str,
    pub profile_name: &'a str,
    pub requested_bw_kbps: u32,
    pub requested_ret_bw_kbps: u32,
    pub priority_class: u32,
    pub qos_level: u32,
    /// Link the client asked for, if any.
    pub preferred_link: Option<&'a str>,
    pub flight_phase: Option<&'a str>,
}

/// A successful decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub link_name: String,
    pub granted_bw_kbps: u32,
    pub granted_ret_bw_kbps: u32,
    pub qos_level: u32,
    pub traffic_class: String,
    pub score: i64,
    /// Human-readable justification returned to the client.
    pub reason: String,
}

/// A typed denial; each maps onto an answer the client can act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyDenial {
    #[error("client '{0}' not found in configuration")]
    UnknownClient(String),
    #[error("client '{0}' profile is disabled")]
    ClientDisabled(String),
    #[error("requested bandwidth ({requested} kbps) exceeds client limit ({limit} kbps)")]
    BandwidthExceedsProfile { requested: u32, limit: u32 },
    #[error("no policy rulesets configured")]
    NoRulesets,
    #[error("no policy rule for traffic class '{0}'")]
    NoRule(String),
    #[error("no suitable link available (all offline or prohibited)")]
    NoSuitableLink,
}

/// Resolve the request's traffic class against the configured class
/// definitions: first explicit match (priority class, QoS level, or
/// profile-name pattern) wins, then the flagged default, finally
/// `BEST_EFFORT`.
pub fn classify_traffic(
    config: &Config,
    priority_class: u32,
    qos_level: u32,
    profile_name: &str,
) -> String {
    let mut fallback = "BEST_EFFORT";
    for def in &config.traffic_classes {
        if def.default {
            fallback = &def.id;
            continue;
        }
        if def.priority_class == Some(priority_class) && priority_class != 0 {
            return def.id.clone();
        }
        if def.qos_level == Some(qos_level) {
            return def.id.clone();
        }
        if def
            .profile_patterns
            .iter()
            .any(|p| wildcard_match(p, profile_name))
        {
            return def.id.clone();
        }
    }
    fallback.to_owned()
}

/// Trailing-`*` wildcard match, as the class catalog uses.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// Coverage box check against the aircraft position. Altitude is
/// configured in feet; ADIF reports meters.
fn in_coverage(coverage: &CoverageConfig, adif: &AdifSnapshot) -> bool {
    if !coverage.enabled {
        return true;
    }
    let (Some(lat), Some(lon)) = (adif.latitude_deg, adif.longitude_deg) else {
        return true;
    };
    if lat < coverage.min_latitude || lat > coverage.max_latitude {
        return false;
    }
    if lon < coverage.min_longitude || lon > coverage.max_longitude {
        return false;
    }
    if let Some(alt_m) = adif.altitude_m {
        let alt_ft = alt_m * METERS_TO_FEET;
        if alt_ft < coverage.min_altitude_ft as f64 || alt_ft > coverage.max_altitude_ft as f64 {
            return false;
        }
    }
    true
}

/// Score one candidate link against a preference. `REJECTED` marks a
/// failed hard constraint.
fn score_link(
    entry: &LinkEntry,
    pref: &PathPreference,
    requested_bw_kbps: u32,
    preferred: Option<&str>,
) -> i64 {
    if let Some(max_latency) = pref.max_latency_ms {
        if entry.capabilities.typical_latency_ms > max_latency {
            return REJECTED;
        }
    }

    // Ranking carries the most weight: ranking 1 scores 9000.
    let mut score = (10 - pref.ranking as i64) * 1000;

    // Bandwidth headroom: +1 per 100 kbps spare, heavy penalty if short.
    if entry.capabilities.max_bandwidth_kbps >= requested_bw_kbps {
        let headroom = entry.capabilities.max_bandwidth_kbps - requested_bw_kbps;
        score += (headroom / 100) as i64;
    } else {
        score -= 5000;
    }

    // Latency bonus.
    if entry.capabilities.typical_latency_ms < 50 {
        score += 100;
    } else if entry.capabilities.typical_latency_ms > 500 {
        score -= 50;
    }

    // Link-type stability bonus.
    if entry.link_type.is_satellite() {
        score += 5;
    } else if entry.link_type.is_cellular() {
        score += 3;
    } else if entry.link_type == magic_mih::LinkType::AirToGround {
        score += 4;
    }

    // Load balancing: each active bearer costs more than one ranking step
    // is worth half of, so two bearers outweigh a ranking difference of 1.
    score -= entry.active_bearer_count() as i64 * 600;

    // Preferred link of the client.
    if preferred == Some(entry.name.as_str()) {
        score += 500;
    }

    score
}

fn find_rule<'a>(
    rules: &'a [PolicyRule],
    traffic_class: &str,
    priority_class: u32,
) -> Option<&'a PolicyRule> {
    rules
        .iter()
        .find(|r| r.traffic_class == traffic_class)
        .or_else(|| rules.iter().find(|r| r.traffic_class == "ALL_TRAFFIC"))
        .or_else(|| {
            if priority_class == 0 {
                return None;
            }
            let synonym = format!("PRIORITY_{priority_class}");
            rules.iter().find(|r| r.traffic_class == synonym)
        })
}

/// Select the best link for a request.
///
/// `links` is a registry snapshot; `adif` the aircraft data at the same
/// moment. The function holds no locks and performs no I/O.
pub fn select_path(
    config: &Config,
    links: &[LinkEntry],
    adif: &AdifSnapshot,
    req: &PolicyRequest<'_>,
) -> Result<PolicyDecision, PolicyDenial> {
    let client = config
        .find_client(req.client_id)
        .ok_or_else(|| PolicyDenial::UnknownClient(req.client_id.to_owned()))?;
    if !client.enabled {
        return Err(PolicyDenial::ClientDisabled(req.client_id.to_owned()));
    }
    if req.requested_bw_kbps > client.max_forward_kbps {
        return Err(PolicyDenial::BandwidthExceedsProfile {
            requested: req.requested_bw_kbps,
            limit: client.max_forward_kbps,
        });
    }

    let ruleset = config
        .ruleset_for_phase(req.flight_phase)
        .ok_or(PolicyDenial::NoRulesets)?;

    let traffic_class = classify_traffic(
        config,
        req.priority_class,
        req.qos_level,
        req.profile_name,
    );
    debug!(
        client = req.client_id,
        phase = ruleset.flight_phase,
        class = traffic_class,
        "policy decision start"
    );

    let rule = find_rule(&ruleset.rules, &traffic_class, req.priority_class)
        .ok_or_else(|| PolicyDenial::NoRule(traffic_class.clone()))?;

    // The client's explicit preference outranks the profile's standing one.
    let preferred = req.preferred_link.or(client.preferred_link.as_deref());

    let mut best: Option<(&LinkEntry, &PathPreference, i64)> = None;
    for pref in &rule.preferences {
        if pref.action == PreferenceAction::Prohibit {
            debug!(link = pref.link_name, "candidate prohibited");
            continue;
        }
        if !client.is_link_allowed(&pref.link_name) {
            debug!(link = pref.link_name, "candidate not in client allow-list");
            continue;
        }
        let Some(entry) = links.iter().find(|l| l.name == pref.link_name) else {
            debug!(link = pref.link_name, "candidate not registered");
            continue;
        };
        if !entry.link_up {
            debug!(link = pref.link_name, "candidate is down");
            continue;
        }
        if !adif.degraded {
            if let Some(dl) = config.find_datalink(&pref.link_name) {
                if !in_coverage(&dl.coverage, adif) {
                    debug!(link = pref.link_name, "aircraft outside coverage box");
                    continue;
                }
            }
        }
        if let Some(on_ground) = adif.on_ground {
            if pref.on_ground_only && !on_ground {
                debug!(link = pref.link_name, "candidate is on-ground only");
                continue;
            }
            if pref.airborne_only && on_ground {
                debug!(link = pref.link_name, "candidate is airborne only");
                continue;
            }
        }

        let score = score_link(entry, pref, req.requested_bw_kbps, preferred);
        if score == REJECTED {
            debug!(
                link = pref.link_name,
                max_latency = ?pref.max_latency_ms,
                "candidate exceeds latency bound"
            );
            continue;
        }
        debug!(link = pref.link_name, score, ranking = pref.ranking, "candidate scored");
        if best.map(|(_, _, s)| score > s).unwrap_or(true) {
            best = Some((entry, pref, score));
        }
    }

    let (entry, pref, score) = best.ok_or(PolicyDenial::NoSuitableLink)?;
    Ok(PolicyDecision {
        link_name: entry.name.clone(),
        granted_bw_kbps: req.requested_bw_kbps,
        granted_ret_bw_kbps: req.requested_ret_bw_kbps,
        qos_level: req.qos_level,
        traffic_class,
        score,
        reason: format!(
            "Selected {} (ranking {}, score {})",
            entry.name, pref.ranking, score
        ),
    })
}

/// Link-switch hysteresis gate for an ACTIVE session.
///
/// Moving from the current link is only allowed when the session has
/// dwelt long enough and the new link is better by at least the
/// configured margin. Returns false for a same-link "switch".
pub fn can_switch_link(
    switching: &SwitchingSection,
    session: &Session,
    new_link: &str,
    new_bw_percent: u32,
    now: Instant,
) -> bool {
    let Some(current) = session.assigned_link.as_deref() else {
        return true; // first assignment
    };
    if current == new_link {
        return false;
    }
    if let Some(last_switch) = session.last_link_switch {
        let elapsed = now.duration_since(last_switch).as_secs();
        if elapsed < switching.min_dwell_time_sec {
            debug!(
                session = %session.session_id,
                elapsed,
                dwell = switching.min_dwell_time_sec,
                "dwell time not met, deny switch"
            );
            return false;
        }
    }
    let current_pct = session.current_bw_percent;
    if current_pct > 0 && new_bw_percent > 0 {
        let threshold = current_pct + current_pct * switching.hysteresis_percent / 100;
        if new_bw_percent < threshold {
            debug!(
                session = %session.session_id,
                new = new_bw_percent,
                threshold,
                "hysteresis not met, deny switch"
            );
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::LinkRegistry;
    use magic_mih::{LinkCapabilities, LinkParameters, LinkType, QosParam};
    use std::time::Duration;

    fn config() -> Config {
        toml::from_str(
            r#"
            [[datalinks]]
            name = "SATCOM"
            link_type = "satcom-ku"
            max_forward_bw_kbps = 30000
            max_return_bw_kbps = 2000
            latency_ms = 600
            cost_factor = 0.5

            [[datalinks]]
            name = "CELLULAR"
            link_type = "lte"
            max_forward_bw_kbps = 50000
            max_return_bw_kbps = 50000
            latency_ms = 50
            cost_factor = 0.05

            [[clients]]
            client_id = "AC1"
            password = "secret"
            max_forward_kbps = 20000

            [[traffic_classes]]
            id = "DATA"
            profile_patterns = ["IP_*"]

            [[traffic_classes]]
            id = "VOICE"
            profile_patterns = ["VOICE"]

            [[traffic_classes]]
            id = "BEST_EFFORT"
            default = true

            [[rulesets]]
            flight_phase = "CRUISE"

            [[rulesets.rules]]
            traffic_class = "DATA"

            [[rulesets.rules.preferences]]
            link_name = "CELLULAR"
            ranking = 1

            [[rulesets.rules.preferences]]
            link_name = "SATCOM"
            ranking = 2

            [[rulesets.rules]]
            traffic_class = "VOICE"

            [[rulesets.rules.preferences]]
            link_name = "CELLULAR"
            ranking = 1
            max_latency_ms = 100
            "#,
        )
        .unwrap()
    }

    fn satcom_caps() -> LinkCapabilities {
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

    fn cellular_caps() -> LinkCapabilities {
        LinkCapabilities {
            max_bandwidth_kbps: 50_000,
            typical_latency_ms: 50,
            cost_per_mb: 5,
            coverage: 2,
            security_level: 3,
            mtu: 1500,
            is_asymmetric: false,
        }
    }

    fn both_up(config: &Config) -> LinkRegistry {
        let reg = LinkRegistry::new(config);
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", satcom_caps(), 1).unwrap();
        reg.register("CELLULAR", LinkType::LteFdd, "wwan0", cellular_caps(), 2).unwrap();
        reg.mark_up("SATCOM", LinkParameters::default()).unwrap();
        reg.mark_up("CELLULAR", LinkParameters::default()).unwrap();
        reg
    }

    fn request<'a>(profile: &'a str, bw: u32) -> PolicyRequest<'a> {
        PolicyRequest {
            client_id: "AC1",
            profile_name: profile,
            requested_bw_kbps: bw,
            requested_ret_bw_kbps: 0,
            priority_class: 0,
            qos_level: 0,
            preferred_link: None,
            flight_phase: Some("CRUISE"),
        }
    }

    #[test]
    fn classification_first_match_then_default() {
        let config = config();
        assert_eq!(classify_traffic(&config, 0, 0, "IP_DATA"), "DATA");
        assert_eq!(classify_traffic(&config, 0, 0, "VOICE"), "VOICE");
        assert_eq!(classify_traffic(&config, 0, 0, "TELEMETRY"), "BEST_EFFORT");
    }

    #[test]
    fn data_request_picks_cellular() {
        let config = config();
        let links = both_up(&config).snapshot();
        let decision =
            select_path(&config, &links, &AdifSnapshot::default(), &request("IP_DATA", 1000))
                .unwrap();
        assert_eq!(decision.link_name, "CELLULAR");
        assert_eq!(decision.granted_bw_kbps, 1000);
        assert_eq!(decision.traffic_class, "DATA");
    }

    #[test]
    fn policy_is_pure() {
        let config = config();
        let links = both_up(&config).snapshot();
        let adif = AdifSnapshot::default();
        let req = request("IP_DATA", 1000);
        let a = select_path(&config, &links, &adif, &req).unwrap();
        let b = select_path(&config, &links, &adif, &req).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_client_denied() {
        let config = config();
        let links = both_up(&config).snapshot();
        let mut req = request("IP_DATA", 1000);
        req.client_id = "GHOST";
        assert!(matches!(
            select_path(&config, &links, &AdifSnapshot::default(), &req),
            Err(PolicyDenial::UnknownClient(_))
        ));
    }

    #[test]
    fn profile_cap_enforced() {
        let config = config();
        let links = both_up(&config).snapshot();
        assert!(matches!(
            select_path(
                &config,
                &links,
                &AdifSnapshot::default(),
                &request("IP_DATA", 25_000)
            ),
            Err(PolicyDenial::BandwidthExceedsProfile { limit: 20_000, .. })
        ));
    }

    #[test]
    fn latency_bound_denies_when_only_slow_link() {
        let config = config();
        let reg = LinkRegistry::new(&config);
        reg.register("SATCOM", LinkType::SatcomKu, "sat0", satcom_caps(), 1).unwrap();
        reg.mark_up("SATCOM", LinkParameters::default()).unwrap();
        let links = reg.snapshot();

        let err =
            select_path(&config, &links, &AdifSnapshot::default(), &request("VOICE", 64))
                .unwrap_err();
        assert_eq!(err, PolicyDenial::NoSuitableLink);
        assert_eq!(
            err.to_string(),
            "no suitable link available (all offline or prohibited)"
        );
    }

    #[test]
    fn down_links_rejected() {
        let config = config();
        let reg = both_up(&config);
        reg.mark_down("CELLULAR", magic_mih::LinkDownReason::SignalLoss, "fade").unwrap();
        let links = reg.snapshot();
        let decision =
            select_path(&config, &links, &AdifSnapshot::default(), &request("IP_DATA", 1000))
                .unwrap();
        assert_eq!(decision.link_name, "SATCOM");
    }

    #[test]
    fn load_penalty_balances_bearers() {
        let config = config();
        let reg = both_up(&config);
        // Two bearers on CELLULAR flips the choice to SATCOM despite its
        // worse ranking (penalty 1200 > ranking gap 1000).
        reg.allocate_bearer(
            "CELLULAR",
            QosParam {
                forward_rate_kbps: 100,
                ..QosParam::default()
            },
        )
        .unwrap();
        reg.allocate_bearer(
            "CELLULAR",
            QosParam {
                forward_rate_kbps: 100,
                ..QosParam::default()
            },
        )
        .unwrap();
        let decision = select_path(
            &config,
            &reg.snapshot(),
            &AdifSnapshot::default(),
            &request("IP_DATA", 1000),
        )
        .unwrap();
        assert_eq!(decision.link_name, "SATCOM");
    }

    #[test]
    fn preferred_link_bonus() {
        let config = config();
        let links = both_up(&config).snapshot();
        let mut req = request("IP_DATA", 1000);
        req.preferred_link = Some("SATCOM");
        // +500 is not enough to beat a full ranking step here, CELLULAR
        // still wins on ranking + headroom + latency.
        let decision =
            select_path(&config, &links, &AdifSnapshot::default(), &req).unwrap();
        assert_eq!(decision.link_name, "CELLULAR");

        // With equal rankings the preference tips the scale; emulate by
        // loading CELLULAR with one bearer (-600) so +500 wins... not
        // quite: check the raw scorer instead.
        let satcom = links.iter().find(|l| l.name == "SATCOM").unwrap();
        let pref = PathPreference {
            link_name: "SATCOM".into(),
            ranking: 1,
            action: PreferenceAction::Permit,
            max_latency_ms: None,
            on_ground_only: false,
            airborne_only: false,
        };
        let with = score_link(satcom, &pref, 1000, Some("SATCOM"));
        let without = score_link(satcom, &pref, 1000, None);
        assert_eq!(with - without, 500);
    }

    #[test]
    fn wow_constraints() {
        let mut config = config();
        config.rulesets[0].rules[0].preferences[0].on_ground_only = true;
        let links = both_up(&config).snapshot();

        let airborne = AdifSnapshot {
            on_ground: Some(false),
            ..AdifSnapshot::default()
        };
        let decision =
            select_path(&config, &links, &airborne, &request("IP_DATA", 1000)).unwrap();
        assert_eq!(decision.link_name, "SATCOM", "ground-only link skipped in flight");

        let on_ground = AdifSnapshot {
            on_ground: Some(true),
            ..AdifSnapshot::default()
        };
        let decision =
            select_path(&config, &links, &on_ground, &request("IP_DATA", 1000)).unwrap();
        assert_eq!(decision.link_name, "CELLULAR");
    }

    #[test]
    fn coverage_box_applies_only_with_position() {
        let mut config = config();
        config.datalinks[1].coverage = CoverageConfig {
            enabled: true,
            min_latitude: 30.0,
            max_latitude: 60.0,
            min_longitude: -10.0,
            max_longitude: 30.0,
            min_altitude_ft: 0,
            max_altitude_ft: 45_000,
            };
        let links = both_up(&config).snapshot();

        // No position: check skipped, CELLULAR wins.
        let decision = select_path(
            &config,
            &links,
            &AdifSnapshot::default(),
            &request("IP_DATA", 1000),
        )
        .unwrap();
        assert_eq!(decision.link_name, "CELLULAR");

        // Out of the box: CELLULAR rejected.
        let far_away = AdifSnapshot {
            latitude_deg: Some(1.0),
            longitude_deg: Some(100.0),
            altitude_m: Some(10_000.0),
            ..AdifSnapshot::default()
        };
        let decision = select_path(&config, &links, &far_away, &request("IP_DATA", 1000)).unwrap();
        assert_eq!(decision.link_name, "SATCOM");

        // Degraded ADIF: check skipped again.
        let degraded = AdifSnapshot {
            degraded: true,
            ..far_away
        };
        let decision = select_path(&config, &links, &degraded, &request("IP_DATA", 1000)).unwrap();
        assert_eq!(decision.link_name, "CELLULAR");
    }

    #[test]
    fn prohibit_rejects() {
        let mut config = config();
        config.rulesets[0].rules[0].preferences[0].action = PreferenceAction::Prohibit;
        let links = both_up(&config).snapshot();
        let decision =
            select_path(&config, &links, &AdifSnapshot::default(), &request("IP_DATA", 1000))
                .unwrap();
        assert_eq!(decision.link_name, "SATCOM");
    }

    #[test]
    fn all_traffic_wildcard_rule() {
        let mut config = config();
        config.rulesets[0].rules[0].traffic_class = "ALL_TRAFFIC".into();
        let links = both_up(&config).snapshot();
        // TELEMETRY classifies to BEST_EFFORT, no exact rule, wildcard hits.
        let decision = select_path(
            &config,
            &links,
            &AdifSnapshot::default(),
            &request("TELEMETRY", 100),
        )
        .unwrap();
        assert_eq!(decision.link_name, "CELLULAR");
    }

    #[test]
    fn priority_synonym_rule() {
        let mut config = config();
        config.rulesets[0].rules[0].traffic_class = "PRIORITY_5".into();
        let links = both_up(&config).snapshot();
        let mut req = request("TELEMETRY", 100);
        req.priority_class = 5;
        let decision =
            select_path(&config, &links, &AdifSnapshot::default(), &req).unwrap();
        assert_eq!(decision.link_name, "CELLULAR");
    }

    // ── hysteresis ─────────────────────────────────────────────────────

    fn active_session(bw_percent: u32, switched_secs_ago: Option<u64>) -> Session {
        let reg = crate::registry::SessionRegistry::new(4);
        let s = reg.create("AC1", "realm", "IP_DATA").unwrap();
        reg.set_state(&s.session_id, crate::registry::SessionState::Authenticated)
            .unwrap();
        let mut s = reg
            .activate(&s.session_id, "IP_DATA", "SATCOM", 1, 1000, 0, 0, None, bw_percent)
            .unwrap();
        s.last_link_switch =
            switched_secs_ago.map(|secs| Instant::now() - Duration::from_secs(secs));
        s
    }

    fn switching() -> SwitchingSection {
        SwitchingSection {
            min_dwell_time_sec: 30,
            hysteresis_percent: 20,
        }
    }

    #[test]
    fn same_link_never_switches() {
        let s = active_session(50, Some(120));
        assert!(!can_switch_link(&switching(), &s, "SATCOM", 99, Instant::now()));
    }

    #[test]
    fn dwell_time_blocks_early_switch() {
        let s = active_session(50, Some(5));
        assert!(!can_switch_link(&switching(), &s, "CELLULAR", 99, Instant::now()));
    }

    #[test]
    fn hysteresis_margin() {
        let s = active_session(50, Some(120));
        // 52% < 50% + 20% margin (threshold 60).
        assert!(!can_switch_link(&switching(), &s, "CELLULAR", 52, Instant::now()));
        // 62% clears the threshold.
        assert!(can_switch_link(&switching(), &s, "CELLULAR", 62, Instant::now()));
    }

    #[test]
    fn first_assignment_always_allowed() {
        let reg = crate::registry::SessionRegistry::new(4);
        let s = reg.create("AC1", "realm", "IP_DATA").unwrap();
        assert!(can_switch_link(&switching(), &s, "CELLULAR", 10, Instant::now()));
    }
}
