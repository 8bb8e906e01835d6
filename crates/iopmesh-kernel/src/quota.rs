//! Quota guard — advisory ceilings on agent and IOP counts, plus the
//! unlicensed time box.
//!
//! The guard never refuses anything. Crossing a ceiling yields a
//! `QuotaExceeded` event and moves the guard to [`LicenseState::Invalid`].

use iopmesh_types::config::QuotaConfig;
use iopmesh_types::event::{EngineEvent, QuotaKind};
use std::time::{Duration, Instant};
use tracing::warn;

/// Whether the agent is within its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseState {
    /// No ceiling crossed and the time box has not elapsed.
    Valid,
    /// Degraded mode; hosts should treat this as a stop signal.
    Invalid(QuotaKind),
}

/// Tracks the agent and IOP ceilings and the unlicensed time box.
#[derive(Debug)]
pub struct QuotaGuard {
    config: QuotaConfig,
    state: LicenseState,
    deadline: Option<Instant>,
}

impl QuotaGuard {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            state: LicenseState::Valid,
            deadline: None,
        }
    }

    pub fn state(&self) -> LicenseState {
        self.state
    }

    /// True after any ceiling was crossed or the time box elapsed.
    pub fn is_degraded(&self) -> bool {
        matches!(self.state, LicenseState::Invalid(_))
    }

    /// `count` includes the local agent.
    pub fn check_agent_count(&mut self, count: usize) -> Option<EngineEvent> {
        self.check(count, self.config.max_agents, QuotaKind::TooManyAgents)
    }

    /// `count` covers all categories.
    pub fn check_iop_count(&mut self, count: usize) -> Option<EngineEvent> {
        self.check(count, self.config.max_iops, QuotaKind::TooManyIops)
    }

    fn check(&mut self, count: usize, max: usize, kind: QuotaKind) -> Option<EngineEvent> {
        if max == 0 || count <= max {
            return None;
        }
        warn!(count, max, %kind, "Quota exceeded");
        Some(self.exceed(kind))
    }

    fn exceed(&mut self, kind: QuotaKind) -> EngineEvent {
        self.state = LicenseState::Invalid(kind);
        EngineEvent::QuotaExceeded { kind }
    }

    /// Arm the time box. A zero duration disarms it.
    pub fn start_unlicensed_timer(&mut self, duration: Duration, now: Instant) {
        self.deadline = (!duration.is_zero()).then(|| now + duration);
    }

    /// A valid license turned up: cancel the time box.
    pub fn license_found(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fire `Timeout` once when the deadline has passed.
    pub fn poll_timer(&mut self, now: Instant) -> Option<EngineEvent> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                warn!("Unlicensed time box elapsed");
                Some(self.exceed(QuotaKind::Timeout))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(max_agents: usize, max_iops: usize) -> QuotaGuard {
        QuotaGuard::new(QuotaConfig {
            max_agents,
            max_iops,
            unlicensed_timeout_secs: 0,
        })
    }

    #[test]
    fn test_unlimited_by_default() {
        let mut g = guard(0, 0);
        assert!(g.check_agent_count(1000).is_none());
        assert!(g.check_iop_count(1000).is_none());
        assert_eq!(g.state(), LicenseState::Valid);
    }

    #[test]
    fn test_sixth_iop_exceeds_five() {
        let mut g = guard(0, 5);
        assert!(g.check_iop_count(5).is_none());
        assert_eq!(
            g.check_iop_count(6),
            Some(EngineEvent::QuotaExceeded {
                kind: QuotaKind::TooManyIops
            })
        );
        assert!(g.is_degraded());
        // Every exceeding check reports again.
        assert!(g.check_iop_count(7).is_some());
    }

    #[test]
    fn test_agent_ceiling() {
        let mut g = guard(2, 0);
        assert!(g.check_agent_count(2).is_none());
        assert!(g.check_agent_count(3).is_some());
        assert_eq!(g.state(), LicenseState::Invalid(QuotaKind::TooManyAgents));
    }

    #[test]
    fn test_timer_fires_once() {
        let mut g = guard(0, 0);
        let start = Instant::now();
        g.start_unlicensed_timer(Duration::from_secs(10), start);
        assert!(g.poll_timer(start + Duration::from_secs(5)).is_none());
        assert!(g.poll_timer(start + Duration::from_secs(10)).is_some());
        assert!(g.poll_timer(start + Duration::from_secs(20)).is_none());
        assert_eq!(g.state(), LicenseState::Invalid(QuotaKind::Timeout));
    }

    #[test]
    fn test_license_found_cancels_timer() {
        let mut g = guard(0, 0);
        let start = Instant::now();
        g.start_unlicensed_timer(Duration::from_secs(1), start);
        g.license_found();
        assert!(g.deadline().is_none());
        assert!(g.poll_timer(start + Duration::from_secs(5)).is_none());
    }
}
