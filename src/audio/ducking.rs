// DuckCounter: nesting-safe music ducking
//
// Each active reason (narration, an input phase, a caller's manual duck)
// holds one increment. The music bus is ducked on the 0 -> 1 edge and
// restored on the 1 -> 0 edge, independent of which caller incremented.

/// Edge produced by a counter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuckChange {
    /// 0 -> 1: apply ducked gain
    Engaged,
    /// Counter moved but stayed above zero
    Held,
    /// 1 -> 0: restore baseline gain
    Released,
    /// Release requested with nothing ducked; counter unchanged
    Unbalanced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuckCounter {
    level: u32,
}

impl DuckCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_ducked(&self) -> bool {
        self.level > 0
    }

    pub fn increment(&mut self) -> DuckChange {
        self.level = self.level.saturating_add(1);
        if self.level == 1 {
            DuckChange::Engaged
        } else {
            DuckChange::Held
        }
    }

    pub fn decrement(&mut self) -> DuckChange {
        match self.level {
            0 => DuckChange::Unbalanced,
            1 => {
                self.level = 0;
                DuckChange::Released
            }
            _ => {
                self.level -= 1;
                DuckChange::Held
            }
        }
    }

    /// Apply `duck(active)` semantics.
    pub fn apply(&mut self, active: bool) -> DuckChange {
        if active {
            self.increment()
        } else {
            self.decrement()
        }
    }
}
