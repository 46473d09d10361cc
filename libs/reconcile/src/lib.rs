//! Reconciliation primitives for keeping a floor of idle build agents.
//!
//! This library holds the pure policy half of the agent-ensurer loop.
//! Nothing in here performs I/O; the service crate fetches state and feeds
//! it through these functions once per cycle. Key concepts:
//!
//! - **Idle agent**: enabled and carrying an `idleSinceTime`.
//! - **Alive-idle agent**: an idle agent that is connected, or that was last
//!   active no more than [`DEAD_DISCONNECTION_THRESHOLD_SECS`] ago.
//! - **Scheduled instance**: a cloud instance in `scheduled_to_start`, i.e. a
//!   launch already in flight.
//! - **Deficit**: how many instances to launch to reach the configured floor.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs and `now`
//! - The deficit is never negative and never double-counts in-flight launches
//! - Timestamps are normalised to UTC before any subtraction

use chrono::{DateTime, FixedOffset, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire format of agent timestamps (`20240115T103000+0100`).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%z";

/// How long a disconnected agent is still trusted as usable.
pub const DEAD_DISCONNECTION_THRESHOLD_SECS: i64 = 5 * 60;

/// Cloud instance state for launches that are still in flight.
pub const SCHEDULED_TO_START: &str = "scheduled_to_start";

/// Agent data that breaks the server's contract.
#[derive(Debug, Error)]
pub enum MalformedAgentError {
    /// A disconnected idle agent without a last-activity time.
    #[error("agent {agent} is disconnected but reports no lastActivityTime")]
    MissingLastActivity { agent: String },

    /// A timestamp that does not match [`TIMESTAMP_FORMAT`].
    #[error("agent {agent} has unparsable {field} {value:?}: {source}")]
    InvalidTimestamp {
        agent: String,
        field: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// The agent list itself could not be decoded.
    #[error("malformed agent payload: {0}")]
    Payload(String),
}

/// A build agent as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: i64,

    #[serde(default)]
    pub name: Option<String>,

    /// Currently reachable by the server.
    pub connected: bool,

    /// Administratively available for work.
    pub enabled: bool,

    /// Present only while the agent is not running a build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_since_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_time: Option<String>,
}

impl Agent {
    /// Enabled and not running a build.
    pub fn is_idle(&self) -> bool {
        self.enabled && self.idle_since_time.is_some()
    }

    /// Name for log output, falling back to the numeric id.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("#{}", self.id),
        }
    }
}

/// A cloud instance as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Free-form; only [`SCHEDULED_TO_START`] is interpreted.
    pub state: String,
}

impl CloudInstance {
    /// Returns true if the launch of this instance is still in flight.
    pub fn is_scheduled_to_start(&self) -> bool {
        self.state == SCHEDULED_TO_START
    }
}

/// Parse a wire timestamp into a UTC instant.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::<FixedOffset>::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|ts| ts.with_timezone(&Utc))
}

/// Render an instant in the wire format, keeping its offset.
pub fn format_timestamp<Tz>(ts: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Why an agent does or does not count toward the idle pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Disabled, or busy with a build.
    NotIdle,

    /// Idle and connected.
    Connected,

    /// Idle, disconnected, but within the grace period.
    RecentlyDisconnected { elapsed: TimeDelta },

    /// Idle, disconnected for longer than the grace period.
    Dead { elapsed: TimeDelta },
}

impl Liveness {
    /// Returns true if the agent counts toward the idle pool.
    pub fn is_alive_idle(&self) -> bool {
        matches!(self, Self::Connected | Self::RecentlyDisconnected { .. })
    }
}

/// Classify a single agent at `now`.
///
/// `lastActivityTime` is only consulted for disconnected idle agents, and is
/// required for them.
pub fn classify(agent: &Agent, now: DateTime<Utc>) -> Result<Liveness, MalformedAgentError> {
    if !agent.is_idle() {
        return Ok(Liveness::NotIdle);
    }
    if agent.connected {
        return Ok(Liveness::Connected);
    }

    let raw = agent
        .last_activity_time
        .as_deref()
        .ok_or_else(|| MalformedAgentError::MissingLastActivity {
            agent: agent.label(),
        })?;
    let last_activity =
        parse_timestamp(raw).map_err(|source| MalformedAgentError::InvalidTimestamp {
            agent: agent.label(),
            field: "lastActivityTime",
            value: raw.to_string(),
            source,
        })?;

    let elapsed = now - last_activity;
    if elapsed > TimeDelta::seconds(DEAD_DISCONNECTION_THRESHOLD_SECS) {
        Ok(Liveness::Dead { elapsed })
    } else {
        Ok(Liveness::RecentlyDisconnected { elapsed })
    }
}

/// Returns true if the agent counts toward the idle pool at `now`.
pub fn is_alive_idle(agent: &Agent, now: DateTime<Utc>) -> Result<bool, MalformedAgentError> {
    classify(agent, now).map(|liveness| liveness.is_alive_idle())
}

/// Idle counts over one agent listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCensus {
    /// Enabled agents with an idle-since time, alive or not.
    pub idle: u32,

    /// Idle agents that are connected or within the grace period.
    pub alive_idle: u32,
}

impl AgentCensus {
    /// Count idle and alive-idle agents.
    ///
    /// Fails on the first malformed agent; a partial count is never returned.
    pub fn from_agents(agents: &[Agent], now: DateTime<Utc>) -> Result<Self, MalformedAgentError> {
        let mut census = Self::default();
        for agent in agents {
            census.record(classify(agent, now)?);
        }
        Ok(census)
    }

    /// Add one classified agent to the counts.
    pub fn record(&mut self, liveness: Liveness) {
        if liveness != Liveness::NotIdle {
            self.idle += 1;
        }
        if liveness.is_alive_idle() {
            self.alive_idle += 1;
        }
    }
}

/// Count instances whose launch is still in flight.
pub fn count_scheduled(instances: &[CloudInstance]) -> u32 {
    instances
        .iter()
        .filter(|instance| instance.is_scheduled_to_start())
        .count() as u32
}

/// How many instances to launch to reach `min_idle`.
///
/// Launches already in flight (`scheduled`) are subtracted so repeated
/// polling does not over-launch while the server catches up.
pub fn compute_deficit(alive_idle: u32, scheduled: u32, min_idle: u32) -> u32 {
    min_idle.saturating_sub(alive_idle.saturating_add(scheduled))
}

/// Everything one reconciliation cycle decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSnapshot {
    pub idle: u32,
    pub alive_idle: u32,
    pub scheduled: u32,
    pub target: u32,
    pub deficit: u32,
}

impl ReconciliationSnapshot {
    /// Build a snapshot, computing the deficit.
    pub fn new(census: AgentCensus, scheduled: u32, target: u32) -> Self {
        Self {
            idle: census.idle,
            alive_idle: census.alive_idle,
            scheduled,
            target,
            deficit: compute_deficit(census.alive_idle, scheduled, target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        parse_timestamp("20250601T120000+0000").unwrap()
    }

    fn agent(connected: bool, enabled: bool, idle: bool, last_activity: Option<String>) -> Agent {
        Agent {
            id: 7,
            name: Some("agent-7".to_string()),
            connected,
            enabled,
            idle_since_time: idle.then(|| "20250601T110000+0000".to_string()),
            last_activity_time: last_activity,
        }
    }

    fn seconds_ago(secs: i64) -> String {
        format_timestamp(&(now() - Duration::seconds(secs)))
    }

    #[test]
    fn test_parse_timestamp_normalises_offset() {
        let plus_two = parse_timestamp("20250601T140000+0200").unwrap();
        let utc = parse_timestamp("20250601T120000+0000").unwrap();
        let minus_five = parse_timestamp("20250601T070000-0500").unwrap();

        assert_eq!(plus_two, utc);
        assert_eq!(minus_five, utc);
    }

    #[test]
    fn test_parse_timestamp_rejects_other_formats() {
        assert!(parse_timestamp("2025-06-01T12:00:00Z").is_err());
        assert!(parse_timestamp("20250601T120000").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn test_non_candidates_are_never_alive() {
        for connected in [true, false] {
            let disabled = agent(connected, false, true, Some(seconds_ago(3600)));
            let busy = agent(connected, true, false, Some(seconds_ago(3600)));
            let both = agent(connected, false, false, None);

            assert!(!is_alive_idle(&disabled, now()).unwrap());
            assert!(!is_alive_idle(&busy, now()).unwrap());
            assert!(!is_alive_idle(&both, now()).unwrap());
        }
    }

    #[test]
    fn test_connected_idle_ignores_last_activity() {
        let no_activity = agent(true, true, true, None);
        let garbled = agent(true, true, true, Some("garbage".to_string()));
        let day_old = agent(true, true, true, Some(seconds_ago(86_400)));

        assert!(is_alive_idle(&no_activity, now()).unwrap());
        assert!(is_alive_idle(&garbled, now()).unwrap());
        assert!(is_alive_idle(&day_old, now()).unwrap());
    }

    #[test]
    fn test_grace_period_boundary_is_inclusive() {
        let at_boundary = agent(false, true, true, Some(seconds_ago(300)));
        let past_boundary = agent(false, true, true, Some(seconds_ago(301)));

        assert!(is_alive_idle(&at_boundary, now()).unwrap());
        assert!(!is_alive_idle(&past_boundary, now()).unwrap());
    }

    #[test]
    fn test_classify_reports_elapsed() {
        let recent = agent(false, true, true, Some(seconds_ago(30)));
        let dead = agent(false, true, true, Some(seconds_ago(600)));

        assert_eq!(
            classify(&recent, now()).unwrap(),
            Liveness::RecentlyDisconnected {
                elapsed: TimeDelta::seconds(30)
            }
        );
        assert_eq!(
            classify(&dead, now()).unwrap(),
            Liveness::Dead {
                elapsed: TimeDelta::seconds(600)
            }
        );
    }

    #[test]
    fn test_offset_timestamps_compare_as_instants() {
        // 12:03 in +0200 is 10:03 UTC, two hours before `now`.
        let shifted = agent(false, true, true, Some("20250601T120300+0200".to_string()));
        assert!(!is_alive_idle(&shifted, now()).unwrap());

        // 07:58 in -0400 is 11:58 UTC, two minutes before `now`.
        let shifted = agent(false, true, true, Some("20250601T075800-0400".to_string()));
        assert!(is_alive_idle(&shifted, now()).unwrap());
    }

    #[test]
    fn test_disconnected_idle_requires_last_activity() {
        let missing = agent(false, true, true, None);
        assert!(matches!(
            classify(&missing, now()),
            Err(MalformedAgentError::MissingLastActivity { .. })
        ));

        let garbled = agent(false, true, true, Some("yesterday".to_string()));
        match classify(&garbled, now()) {
            Err(MalformedAgentError::InvalidTimestamp { field, value, .. }) => {
                assert_eq!(field, "lastActivityTime");
                assert_eq!(value, "yesterday");
            }
            other => panic!("expected InvalidTimestamp, got {other:?}"),
        }
    }

    #[test]
    fn test_census_counts_idle_and_alive() {
        let agents = vec![
            agent(false, true, true, Some(seconds_ago(600))),
            agent(true, true, true, None),
            agent(true, true, false, None),
            agent(false, true, true, Some(seconds_ago(60))),
            agent(true, false, true, None),
        ];

        let census = AgentCensus::from_agents(&agents, now()).unwrap();
        assert_eq!(census.idle, 3);
        assert_eq!(census.alive_idle, 2);
    }

    #[test]
    fn test_census_fails_on_malformed_agent() {
        let agents = vec![agent(true, true, true, None), agent(false, true, true, None)];
        assert!(AgentCensus::from_agents(&agents, now()).is_err());
    }

    #[test]
    fn test_count_scheduled_ignores_other_states() {
        let instance = |state: &str| CloudInstance {
            id: format!("img-{state}"),
            name: None,
            state: state.to_string(),
        };
        let instances = vec![
            instance("scheduled_to_start"),
            instance("starting"),
            instance("running"),
            instance("scheduled_to_start"),
            instance("stopping"),
        ];

        assert_eq!(count_scheduled(&instances), 2);
        assert_eq!(count_scheduled(&[]), 0);
    }

    #[test]
    fn test_deficit_scenarios() {
        assert_eq!(compute_deficit(1, 1, 3), 1);
        assert_eq!(compute_deficit(2, 0, 2), 0);
        assert_eq!(compute_deficit(0, 0, 0), 0);
        assert_eq!(compute_deficit(5, 3, 2), 0);
        assert_eq!(compute_deficit(u32::MAX, u32::MAX, 4), 0);
    }

    #[test]
    fn test_snapshot_uses_alive_not_idle() {
        let census = AgentCensus {
            idle: 3,
            alive_idle: 1,
        };
        let snapshot = ReconciliationSnapshot::new(census, 1, 3);

        assert_eq!(snapshot.deficit, 1);
        assert_eq!(snapshot.idle, 3);
        assert_eq!(snapshot.target, 3);
    }

    #[test]
    fn test_agent_deserialization() {
        let json = r#"{
            "id": 12,
            "name": "linux-cloud-1",
            "connected": false,
            "enabled": true,
            "idleSinceTime": "20250601T115500+0000",
            "lastActivityTime": "20250601T115800+0000",
            "href": "/app/rest/agents/id:12"
        }"#;

        let agent: Agent = serde_json::from_str(json).unwrap();
        assert_eq!(agent.id, 12);
        assert_eq!(agent.label(), "linux-cloud-1");
        assert!(agent.is_idle());
        assert!(is_alive_idle(&agent, now()).unwrap());
    }

    #[test]
    fn test_agent_without_connected_flag_is_rejected() {
        let json = r#"{"id": 3, "enabled": true}"#;
        assert!(serde_json::from_str::<Agent>(json).is_err());
    }

    proptest! {
        #[test]
        fn prop_deficit_is_floor_gap(
            alive in 0u32..10_000,
            scheduled in 0u32..10_000,
            min in 0u32..10_000,
        ) {
            let deficit = compute_deficit(alive, scheduled, min);
            prop_assert!(deficit <= min);
            if alive + scheduled <= min {
                prop_assert_eq!(deficit, min - alive - scheduled);
            } else {
                prop_assert_eq!(deficit, 0);
            }
        }

        #[test]
        fn prop_disconnected_alive_iff_within_threshold(secs in -600i64..3_600) {
            let candidate = agent(false, true, true, Some(seconds_ago(secs)));
            let alive = is_alive_idle(&candidate, now()).unwrap();
            prop_assert_eq!(alive, secs <= DEAD_DISCONNECTION_THRESHOLD_SECS);
        }

        #[test]
        fn prop_connected_idle_always_alive(secs in 0i64..1_000_000) {
            let candidate = agent(true, true, true, Some(seconds_ago(secs)));
            prop_assert!(is_alive_idle(&candidate, now()).unwrap());
        }
    }
}
