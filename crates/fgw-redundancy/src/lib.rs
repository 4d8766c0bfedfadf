//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Active/standby coordination for cooperating gateway nodes."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
//! Active/standby coordination for gateway nodes sharing a driver instance.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

mod coordinator;
mod state;

pub use coordinator::RedundancyCoordinator;
pub use state::{Decision, RedundancyState, Role, TransitionReason};

/// Shared view of whether this process currently holds the active role.
///
/// Written by the coordinator only; every other task reads it.
#[derive(Debug, Clone, Default)]
pub struct ActiveFlag(Arc<FlagState>);

#[derive(Debug, Default)]
struct FlagState {
    active: AtomicBool,
    promotions: AtomicU64,
}

impl ActiveFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.0.active.load(Ordering::Acquire)
    }

    pub fn set(&self, active: bool) {
        let was_active = self.0.active.swap(active, Ordering::AcqRel);
        if active && !was_active {
            self.0.promotions.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of standby to active transitions seen so far. Readers compare it
    /// with the last value they observed to notice a promotion they slept through.
    pub fn promotions(&self) -> u64 {
        self.0.promotions.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotions_count_only_rising_edges() {
        let flag = ActiveFlag::new();
        assert_eq!(flag.promotions(), 0);
        flag.set(true);
        flag.set(true);
        assert_eq!(flag.promotions(), 1);
        flag.set(false);
        flag.set(false);
        assert_eq!(flag.promotions(), 1);
        flag.set(true);
        assert!(flag.is_active());
        assert_eq!(flag.promotions(), 2);
    }
}
