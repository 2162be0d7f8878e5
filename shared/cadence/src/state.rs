//! The cadence state vector and the phase model / transition rule that
//! governs it.

/// Which phase of training the current epoch falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Cycling,
    Cooldown,
}

/// `(epoch, current_batch, last_batch, global_skip g, local_skip ℓ,
/// batches_to_wait w, send_mod m, send_mod_prev m′, max_gs G_max)`.
#[derive(Debug, Clone)]
pub struct CadenceState {
    pub epoch: u32,
    pub current_batch: u32,
    pub last_batch: Option<u32>,
    pub global_skip: u32,
    pub local_skip: u32,
    pub batches_to_wait: u32,
    pub send_mod: u32,
    pub send_mod_prev: u32,
    pub max_global_skip: u32,
    pub num_local_subgroups: u32,
}

impl CadenceState {
    pub fn new(max_global_skip: u32, num_local_subgroups: u32) -> Self {
        Self {
            epoch: 0,
            current_batch: 0,
            last_batch: None,
            global_skip: 0,
            local_skip: 0,
            batches_to_wait: 0,
            send_mod: 0,
            send_mod_prev: 0,
            max_global_skip,
            num_local_subgroups,
        }
    }

    pub fn phase(&self, warmup_epochs: u32, cooldown_epochs: u32, total_epochs: u32) -> Phase {
        if self.epoch < warmup_epochs {
            Phase::Warmup
        } else if self.epoch >= total_epochs.saturating_sub(cooldown_epochs) {
            Phase::Cooldown
        } else {
            Phase::Cycling
        }
    }

    /// Seeds the cycling phase's cadence parameters. Called exactly once,
    /// on the epoch boundary where training enters cycling.
    pub fn seed_cycling(&mut self) {
        self.global_skip = 4;
        self.local_skip = 1;
        self.batches_to_wait = 1;
    }

    /// Applies the plateau-driven transition rule at an epoch boundary.
    /// No-op when not stable.
    pub fn apply_plateau_transition(&mut self, stable: bool) {
        if !stable {
            return;
        }
        if self.global_skip > 1 {
            self.global_skip /= 2;
            self.local_skip = (self.local_skip / 2).max(1);
            // An unclamped decrement here could go negative; clamp to >= 1
            // while g > 0, to 0 once g == 0.
            self.batches_to_wait = if self.global_skip > 0 {
                self.batches_to_wait.saturating_sub(1).max(1)
            } else {
                0
            };
        } else if self.global_skip == 1 {
            self.global_skip = self.max_global_skip;
            self.local_skip = (self.max_global_skip / 4).max(1);
            self.batches_to_wait = (self.max_global_skip / 4).max(1);
        }
    }

    /// Forces the warmup/cooldown cadence: blocking sync on every batch.
    pub fn set_blocking_sync(&mut self) {
        self.global_skip = 0;
        self.local_skip = 0;
        self.batches_to_wait = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g_equals_one_and_stable_resets_to_ceiling() {
        let mut state = CadenceState::new(8, 1);
        state.global_skip = 1;
        state.local_skip = 1;
        state.batches_to_wait = 1;
        state.apply_plateau_transition(true);
        assert_eq!(state.global_skip, 8);
        assert_eq!(state.local_skip, 2);
        assert_eq!(state.batches_to_wait, 2);
    }

    #[test]
    fn unstable_leaves_state_unchanged() {
        let mut state = CadenceState::new(8, 1);
        state.global_skip = 4;
        state.local_skip = 2;
        state.batches_to_wait = 2;
        state.apply_plateau_transition(false);
        assert_eq!(state.global_skip, 4);
        assert_eq!(state.local_skip, 2);
        assert_eq!(state.batches_to_wait, 2);
    }

    #[test]
    fn halving_floors_local_skip_and_wait_at_one() {
        let mut state = CadenceState::new(8, 1);
        state.global_skip = 2;
        state.local_skip = 1;
        state.batches_to_wait = 1;
        state.apply_plateau_transition(true);
        assert_eq!(state.global_skip, 1);
        assert_eq!(state.local_skip, 1);
        assert_eq!(state.batches_to_wait, 1);
    }

    #[test]
    fn phase_boundaries() {
        let state = CadenceState::new(8, 1);
        assert_eq!(state.phase(2, 2, 10), Phase::Warmup);
        let mut mid = state.clone();
        mid.epoch = 5;
        assert_eq!(mid.phase(2, 2, 10), Phase::Cycling);
        let mut late = state.clone();
        late.epoch = 8;
        assert_eq!(late.phase(2, 2, 10), Phase::Cooldown);
    }
}
