//! Phase coordinator.
//!
//! Drives the session through `Lobby -> AwaitingSceneLoad -> Gameplay`. Both
//! gates use the same `is_ready` field: a caller marks itself ready, the
//! coordinator evaluates the conjunction over every live session, and on
//! success resets every flag before advancing.
//!
//! There is no quorum and no timeout. A participant that never reports in
//! blocks the session; leaving does not trigger an evaluation.

use arena_shared::{
    error::{SessionError, SessionResult},
    net::{ClientId, Phase},
};
use tracing::{debug, info};

use crate::registry::SessionRegistry;

/// Result of a readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Caller marked ready; someone is still missing.
    Waiting,
    /// Everyone was ready; the session moved to the given phase.
    Advanced(Phase),
}

/// Monotonic phase state machine.
#[derive(Debug)]
pub struct PhaseCoordinator {
    phase: Phase,
}

impl Default for PhaseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseCoordinator {
    pub fn new() -> Self {
        Self { phase: Phase::Lobby }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Lobby readiness report.
    pub fn ready_up(&mut self, registry: &mut SessionRegistry, caller: ClientId) -> SessionResult<PhaseOutcome> {
        self.report(registry, caller, Phase::Lobby, Phase::AwaitingSceneLoad)
    }

    /// Scene-load readiness report.
    pub fn scene_loaded(&mut self, registry: &mut SessionRegistry, caller: ClientId) -> SessionResult<PhaseOutcome> {
        self.report(registry, caller, Phase::AwaitingSceneLoad, Phase::Gameplay)
    }

    /// Fails unless the session is in `phase`.
    pub fn require(&self, phase: Phase) -> SessionResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(SessionError::invalid_state(format!(
                "expected phase {:?}, session is in {:?}",
                phase, self.phase
            )))
        }
    }

    fn report(
        &mut self,
        registry: &mut SessionRegistry,
        caller: ClientId,
        expected: Phase,
        next: Phase,
    ) -> SessionResult<PhaseOutcome> {
        self.require(expected)?;
        registry.mark_ready(caller)?;

        if !registry.all_ready() {
            debug!(
                client_id = ?caller,
                ready = registry.ready_count(),
                total = registry.len(),
                "Waiting for players"
            );
            return Ok(PhaseOutcome::Waiting);
        }

        registry.reset_ready()?;
        self.phase = next;
        info!(phase = ?next, players = registry.len(), "Phase advanced");
        Ok(PhaseOutcome::Advanced(next))
    }
}
