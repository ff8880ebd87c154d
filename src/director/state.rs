// AppState and the transition table
//
// The table is the closed set of allowed (from, to) pairs. Each allowed pair
// carries a side-effect descriptor telling the Director which audio actions
// to run around the commit.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// UI mode of the session. Exactly one is current at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Idle,
    MapBrowse,
    LevelLoading,
    TutorSpeaking,
    InputActive,
    Evaluating,
    Celebration,
    Error,
}

impl AppState {
    pub const ALL: [AppState; 8] = [
        AppState::Idle,
        AppState::MapBrowse,
        AppState::LevelLoading,
        AppState::TutorSpeaking,
        AppState::InputActive,
        AppState::Evaluating,
        AppState::Celebration,
        AppState::Error,
    ];

    /// States that hold the music bus ducked while they are current.
    pub fn ducks_music(self) -> bool {
        matches!(
            self,
            AppState::TutorSpeaking | AppState::InputActive | AppState::Evaluating
        )
    }
}

/// Side effects attached to one allowed transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionEffect {
    /// Request ducked music gain after the new state is committed
    pub duck_on_entry: bool,
    /// Release the Director's duck before leaving the old state
    pub restore_on_exit: bool,
}

impl TransitionEffect {
    pub const NONE: TransitionEffect = TransitionEffect {
        duck_on_entry: false,
        restore_on_exit: false,
    };

    /// Effect derived from the ducking attribute of both ends.
    ///
    /// Ducking -> ducking carries no effect so the counter never dips to zero
    /// between the exit and entry actions.
    pub fn between(from: AppState, to: AppState) -> Self {
        Self {
            duck_on_entry: !from.ducks_music() && to.ducks_music(),
            restore_on_exit: from.ducks_music() && !to.ducks_music(),
        }
    }
}

/// Allowed (from, to) pairs and their side effects.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    entries: HashMap<(AppState, AppState), TransitionEffect>,
}

static STANDARD: Lazy<TransitionTable> = Lazy::new(|| {
    use AppState::{
        Celebration, Error, Evaluating, Idle, InputActive, LevelLoading, MapBrowse, TutorSpeaking,
    };

    let mut table = TransitionTable::empty();
    let pairs: [(AppState, &[AppState]); 8] = [
        (Idle, &[MapBrowse, TutorSpeaking, Error]),
        (MapBrowse, &[LevelLoading, TutorSpeaking, Idle, Error]),
        (LevelLoading, &[TutorSpeaking, InputActive, MapBrowse, Error]),
        (
            TutorSpeaking,
            &[InputActive, Celebration, MapBrowse, Idle, Error],
        ),
        (
            InputActive,
            &[Evaluating, TutorSpeaking, MapBrowse, Idle, Error],
        ),
        (Evaluating, &[InputActive, TutorSpeaking, Celebration, Error]),
        (Celebration, &[InputActive, MapBrowse, Idle, Error]),
        (Error, &[MapBrowse, Idle]),
    ];
    for (from, targets) in pairs {
        for &to in targets {
            table.allow(from, to, TransitionEffect::between(from, to));
        }
    }
    table
});

impl TransitionTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The session's standard table.
    pub fn standard() -> Self {
        STANDARD.clone()
    }

    pub fn allow(&mut self, from: AppState, to: AppState, effect: TransitionEffect) {
        self.entries.insert((from, to), effect);
    }

    /// `None` means the pair is not allowed.
    pub fn lookup(&self, from: AppState, to: AppState) -> Option<TransitionEffect> {
        self.entries.get(&(from, to)).copied()
    }

    pub fn is_allowed(&self, from: AppState, to: AppState) -> bool {
        self.entries.contains_key(&(from, to))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_has_no_self_loops() {
        let table = TransitionTable::standard();
        for state in AppState::ALL {
            assert!(!table.is_allowed(state, state));
        }
    }

    #[test]
    fn test_every_state_can_reach_error_or_recover() {
        let table = TransitionTable::standard();
        for state in AppState::ALL {
            if state == AppState::Error {
                assert!(table.is_allowed(AppState::Error, AppState::MapBrowse));
            } else {
                assert!(table.is_allowed(state, AppState::Error), "{:?}", state);
            }
        }
    }

    #[test]
    fn test_ducking_effects() {
        let table = TransitionTable::standard();
        let enter = table
            .lookup(AppState::MapBrowse, AppState::TutorSpeaking)
            .unwrap();
        assert!(enter.duck_on_entry);
        assert!(!enter.restore_on_exit);

        let hold = table
            .lookup(AppState::TutorSpeaking, AppState::InputActive)
            .unwrap();
        assert_eq!(hold, TransitionEffect::NONE);

        let leave = table
            .lookup(AppState::InputActive, AppState::MapBrowse)
            .unwrap();
        assert!(leave.restore_on_exit);
        assert!(!leave.duck_on_entry);
    }

    #[test]
    fn test_invalid_pair_is_absent() {
        let table = TransitionTable::standard();
        assert!(table.lookup(AppState::Idle, AppState::Celebration).is_none());
        assert!(table.lookup(AppState::Error, AppState::InputActive).is_none());
    }
}
