use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MotorRunState {
    #[default]
    Idle = 0,
    Running = 1,
    StopRequested = 2,
}

impl MotorRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::StopRequested => "stop_requested",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::StopRequested,
            _ => Self::Idle,
        }
    }
}

/// The ramp's cross-thread cancellation flag.
///
/// Each transition has exactly one writer: callers move Idle→Running (`try_start`)
/// and Running→StopRequested (`request_stop`); only the ramp thread writes Idle.
#[derive(Debug, Default)]
pub struct RunStateCell {
    state: AtomicU8,
}

impl RunStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> MotorRunState {
        MotorRunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn try_start(&self) -> bool {
        self.transition(MotorRunState::Idle, MotorRunState::Running)
    }

    /// Returns false when no ramp was running.
    pub fn request_stop(&self) -> bool {
        self.transition(MotorRunState::Running, MotorRunState::StopRequested)
    }

    pub fn stop_requested(&self) -> bool {
        self.load() == MotorRunState::StopRequested
    }

    pub fn is_idle(&self) -> bool {
        self.load() == MotorRunState::Idle
    }

    pub(crate) fn finish(&self) {
        self.state
            .store(MotorRunState::Idle as u8, Ordering::Release);
    }

    fn transition(&self, from: MotorRunState, to: MotorRunState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_only_from_idle() {
        let cell = RunStateCell::new();
        assert!(cell.try_start());
        assert!(!cell.try_start());
        assert_eq!(cell.load(), MotorRunState::Running);
    }

    #[test]
    fn stop_has_no_effect_when_idle() {
        let cell = RunStateCell::new();
        assert!(!cell.request_stop());
        assert!(cell.is_idle());
    }

    #[test]
    fn stop_then_finish_returns_to_idle() {
        let cell = RunStateCell::new();
        cell.try_start();
        assert!(cell.request_stop());
        assert!(cell.stop_requested());
        assert!(!cell.try_start());
        cell.finish();
        assert!(cell.is_idle());
        assert!(cell.try_start());
    }
}
