use std::sync::atomic::{AtomicU8, Ordering};

use fedemu_wire::EventType;

/// Lifecycle state of the emulation session owning a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionState {
    /// The topology is still being defined; nothing is forwarded.
    #[default]
    Definition = 1,
    Configuration = 2,
    Instantiation = 3,
    Runtime = 4,
    Datacollect = 5,
    Shutdown = 6,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::Configuration,
            3 => Self::Instantiation,
            4 => Self::Runtime,
            5 => Self::Datacollect,
            6 => Self::Shutdown,
            _ => Self::Definition,
        }
    }

    /// The event type announcing this state on the wire.
    pub const fn event_type(self) -> EventType {
        match self {
            Self::Definition => EventType::DefinitionState,
            Self::Configuration => EventType::ConfigurationState,
            Self::Instantiation => EventType::InstantiationState,
            Self::Runtime => EventType::RuntimeState,
            Self::Datacollect => EventType::DatacollectState,
            Self::Shutdown => EventType::ShutdownState,
        }
    }
}

/// A [`SessionState`] readable from any thread.
#[derive(Debug, Default)]
pub(crate) struct SessionStateCell(AtomicU8);

impl SessionStateCell {
    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_round_trips_every_state() {
        let cell = SessionStateCell::default();
        assert_eq!(cell.get(), SessionState::Definition);

        for state in [
            SessionState::Configuration,
            SessionState::Instantiation,
            SessionState::Runtime,
            SessionState::Datacollect,
            SessionState::Shutdown,
            SessionState::Definition,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }
}
