//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Active/standby role tracking for a driver instance."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use fgw_model::DriverInstanceRecord;

/// Role of this process within its redundancy group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Unknown,
    Active,
    Standby,
}

/// Why a poll ended in its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// The instance record names this node as active.
    Assigned,
    /// The peer keep-alive stayed unchanged for the configured number of polls.
    PeerSilent,
    /// Another node holds the active role.
    PeerActive,
    InstanceMissing,
    InstanceDisabled,
    NodeNotAllowed,
}

impl TransitionReason {
    pub fn label(&self) -> &'static str {
        match self {
            TransitionReason::Assigned => "assigned",
            TransitionReason::PeerSilent => "peer_silent",
            TransitionReason::PeerActive => "peer_active",
            TransitionReason::InstanceMissing => "instance_missing",
            TransitionReason::InstanceDisabled => "instance_disabled",
            TransitionReason::NodeNotAllowed => "node_not_allowed",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of feeding one instance record observation into [`RedundancyState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub previous: Role,
    pub role: Role,
    pub reason: TransitionReason,
}

impl Decision {
    pub fn is_active(&self) -> bool {
        self.role == Role::Active
    }

    pub fn is_transition(&self) -> bool {
        self.previous != self.role
    }

    /// The process just gave up the active role.
    pub fn deactivated(&self) -> bool {
        self.previous == Role::Active && self.role == Role::Standby
    }
}

/// Role plus the peer keep-alive bookkeeping used for self-promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedundancyState {
    role: Role,
    unchanged: u32,
    last_seen_keepalive: Option<DateTime<Utc>>,
    primed: bool,
}

impl RedundancyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Consecutive polls that saw the same peer keep-alive.
    pub fn unchanged_polls(&self) -> u32 {
        self.unchanged
    }

    pub fn last_seen_keepalive(&self) -> Option<DateTime<Utc>> {
        self.last_seen_keepalive
    }

    /// Advance the state machine with the instance record read on this poll.
    ///
    /// The first standby observation only primes the keep-alive; each later poll
    /// that sees the same keep-alive increments the counter and reaching
    /// `threshold` promotes this node.
    pub fn observe(
        &mut self,
        record: Option<&DriverInstanceRecord>,
        node_name: &str,
        threshold: u32,
    ) -> Decision {
        let record = match record {
            None => return self.force_standby(TransitionReason::InstanceMissing),
            Some(record) if !record.enabled => {
                return self.force_standby(TransitionReason::InstanceDisabled)
            }
            Some(record) if !record.allows_node(node_name) => {
                return self.force_standby(TransitionReason::NodeNotAllowed)
            }
            Some(record) => record,
        };

        let previous = self.role;
        let keepalive = record.active_node_keep_alive_time_tag;

        if record.active_node_name == node_name {
            self.role = Role::Active;
            self.unchanged = 0;
            self.primed = false;
            self.last_seen_keepalive = keepalive;
            return Decision {
                previous,
                role: Role::Active,
                reason: TransitionReason::Assigned,
            };
        }

        if previous == Role::Active {
            self.role = Role::Standby;
            self.unchanged = 0;
            self.primed = true;
            self.last_seen_keepalive = keepalive;
            return Decision {
                previous,
                role: Role::Standby,
                reason: TransitionReason::PeerActive,
            };
        }

        if self.primed && keepalive == self.last_seen_keepalive {
            self.unchanged += 1;
        } else {
            self.unchanged = 0;
        }
        self.primed = true;
        self.last_seen_keepalive = keepalive;

        if self.unchanged >= threshold {
            self.role = Role::Active;
            self.unchanged = 0;
            self.primed = false;
            return Decision {
                previous,
                role: Role::Active,
                reason: TransitionReason::PeerSilent,
            };
        }

        self.role = Role::Standby;
        Decision {
            previous,
            role: Role::Standby,
            reason: TransitionReason::PeerActive,
        }
    }

    fn force_standby(&mut self, reason: TransitionReason) -> Decision {
        let previous = self.role;
        self.role = Role::Standby;
        self.unchanged = 0;
        self.primed = false;
        self.last_seen_keepalive = None;
        Decision {
            previous,
            role: Role::Standby,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fgw_model::Protocol;

    fn record(active: &str, keepalive: Option<DateTime<Utc>>) -> DriverInstanceRecord {
        DriverInstanceRecord {
            active_node_name: active.to_owned(),
            active_node_keep_alive_time_tag: keepalive,
            ..DriverInstanceRecord::new(Protocol::OpcUa, 1)
        }
    }

    #[test]
    fn assigned_node_becomes_active_immediately() {
        let mut state = RedundancyState::new();
        let decision = state.observe(Some(&record("a", Some(Utc::now()))), "a", 4);
        assert_eq!(decision.previous, Role::Unknown);
        assert!(decision.is_active());
        assert_eq!(decision.reason, TransitionReason::Assigned);
        assert!(decision.is_transition());
    }

    #[test]
    fn standby_promotes_after_threshold_unchanged_polls() {
        let mut state = RedundancyState::new();
        let stale = record("peer", Some(Utc::now()));
        // First poll primes the keep-alive.
        assert_eq!(state.observe(Some(&stale), "b", 4).role, Role::Standby);
        for expected in 1..4 {
            let decision = state.observe(Some(&stale), "b", 4);
            assert_eq!(decision.role, Role::Standby);
            assert_eq!(state.unchanged_polls(), expected);
        }
        let decision = state.observe(Some(&stale), "b", 4);
        assert!(decision.is_active());
        assert_eq!(decision.reason, TransitionReason::PeerSilent);
        assert_eq!(state.unchanged_polls(), 0);
    }

    #[test]
    fn changing_keepalive_resets_counter() {
        let mut state = RedundancyState::new();
        let start = Utc::now();
        state.observe(Some(&record("peer", Some(start))), "b", 4);
        state.observe(Some(&record("peer", Some(start))), "b", 4);
        state.observe(Some(&record("peer", Some(start))), "b", 4);
        assert_eq!(state.unchanged_polls(), 2);
        let fresh = start + Duration::seconds(5);
        state.observe(Some(&record("peer", Some(fresh))), "b", 4);
        assert_eq!(state.unchanged_polls(), 0);
        assert_eq!(state.last_seen_keepalive(), Some(fresh));
    }

    #[test]
    fn active_node_steps_down_when_peer_claims_role() {
        let mut state = RedundancyState::new();
        state.observe(Some(&record("a", Some(Utc::now()))), "a", 4);
        let decision = state.observe(Some(&record("b", Some(Utc::now()))), "a", 4);
        assert!(decision.deactivated());
        assert_eq!(decision.reason, TransitionReason::PeerActive);
    }

    #[test]
    fn missing_disabled_or_disallowed_forces_standby() {
        let mut state = RedundancyState::new();
        state.observe(Some(&record("a", None)), "a", 4);
        assert!(state.observe(None, "a", 4).deactivated());

        let mut disabled = record("a", None);
        disabled.enabled = false;
        let decision = state.observe(Some(&disabled), "a", 4);
        assert_eq!(decision.reason, TransitionReason::InstanceDisabled);
        assert!(!decision.is_active());

        let mut restricted = record("a", None);
        restricted.node_names = vec!["other".into()];
        let decision = state.observe(Some(&restricted), "a", 4);
        assert_eq!(decision.reason, TransitionReason::NodeNotAllowed);
        assert_eq!(state.role(), Role::Standby);
    }
}
