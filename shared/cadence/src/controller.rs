//! The cadence controller: the per-batch state machine that governs
//! warmup/cycling/cooldown, drives overlapping non-blocking global
//! reductions across rotating local-rank-aligned subgroups, and keeps
//! intra-node replicas in sync via local broadcasts.

use std::sync::Arc;

use tracing::{debug, info};

use psyche_comm::{ProcessGroup, ReductionOp};
use psyche_core::{Error, Result, SendRecordSlot};
use psyche_modeling::codec::{self, Layout};
use psyche_modeling::{NamedParameter, NamedParameters};

use crate::config::{CadenceConfig, DowncastType};
use crate::hooks::{GradScaler, LocalOptimizer, LocalParallel, Scheduler};
use crate::state::{CadenceState, Phase};

struct SendRecord {
    /// One handle when the packed buffer fit under `sending_chunk_size`, or
    /// a sequence of handles — one per chunk, in concatenation order — when
    /// it didn't.
    wait: Vec<Box<dyn psyche_comm::WaitHandle>>,
    layout: Layout,
    batches_since_send: u32,
}

pub struct CadenceController<M: NamedParameters> {
    config: CadenceConfig,
    group: Arc<dyn ProcessGroup>,
    /// One process-group handle per local-rank-aligned subgroup, rotated
    /// through to pick which subgroup performs the next global reduction;
    /// `local_subgroup_index` is this rank's own fixed membership.
    subgroups: Vec<Arc<dyn ProcessGroup>>,
    local_subgroup_index: u32,
    plateau: psyche_core::PlateauDetector,
    state: CadenceState,
    send_records: Vec<SendRecordSlot<SendRecord>>,
    model: Option<M>,
    optimizer: Option<Box<dyn LocalOptimizer>>,
    scheduler: Option<Box<dyn Scheduler>>,
    scaler: Option<Box<dyn GradScaler>>,
    local: Box<dyn LocalParallel>,
    running_avg: psyche_core::running_average::RunningAverage,
    global_sync_count: u32,
}

impl<M: NamedParameters> CadenceController<M> {
    pub fn new(
        config: CadenceConfig,
        group: Arc<dyn ProcessGroup>,
        subgroups: Vec<Arc<dyn ProcessGroup>>,
        local_subgroup_index: u32,
        local: Box<dyn LocalParallel>,
        optimizer: Box<dyn LocalOptimizer>,
    ) -> Self {
        let k = subgroups.len() as u32;
        let threshold = config.stability_level;
        Self {
            plateau: psyche_core::PlateauDetector::new(threshold, 2),
            state: CadenceState::new(config.max_global_skips, k),
            send_records: (0..k).map(|_| SendRecordSlot::new()).collect(),
            model: None,
            optimizer: Some(optimizer),
            scheduler: None,
            scaler: None,
            local,
            running_avg: psyche_core::running_average::RunningAverage::new(),
            config,
            group,
            subgroups,
            local_subgroup_index,
            global_sync_count: 0,
        }
    }

    pub fn set_model(&mut self, model: M) {
        self.model = Some(model);
    }

    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }

    pub fn add_scaler(&mut self, scaler: Box<dyn GradScaler>) {
        self.scaler = Some(scaler);
    }

    pub fn set_scheduler(&mut self, scheduler: Box<dyn Scheduler>) {
        self.scheduler = Some(scheduler);
    }

    /// Must be called once, before the first `step()` of an epoch; calling
    /// `step()` with `last_batch` unset is a caller error.
    pub fn set_last_batch(&mut self, last_batch: u32) {
        self.state.last_batch = Some(last_batch);
    }

    pub fn global_sync_count(&self) -> u32 {
        self.global_sync_count
    }

    pub fn zero_grad(&mut self) {
        if let Some(model) = &self.model {
            for NamedParameter { tensor, .. } in model.named_parameters() {
                let grad = tensor.grad();
                if grad.defined() {
                    let _ = grad.zero_();
                }
            }
        }
    }

    fn model_mut(&mut self) -> Result<&mut M> {
        self.model
            .as_mut()
            .ok_or_else(|| Error::Caller("set_model must be called before stepping".into()))
    }

    fn step_underlying_optimizer(&mut self) {
        match (self.scaler.as_mut(), self.optimizer.as_mut()) {
            (Some(scaler), Some(optimizer)) => scaler.step_and_update(optimizer.as_mut()),
            _ => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.step();
                } else if let Some(optimizer) = self.optimizer.as_mut() {
                    optimizer.step();
                }
            }
        }
    }

    /// Consults the plateau detector at an epoch boundary and applies the
    /// cadence transition rule.
    pub fn epoch_loss_logic(&mut self, loss: f64, already_averaged: bool) -> Result<()> {
        let averaged = if already_averaged {
            loss
        } else {
            self.allreduce_mean_loss(loss)?
        };

        if self.config.verbose {
            self.running_avg.add_entry_if_needed("epoch_loss", 8, Some(1));
            self.running_avg.push("epoch_loss", averaged);
            if self.group.rank() == 0 {
                info!(averaged, running_average = ?self.running_avg.sample("epoch_loss"), "epoch loss");
            }
        }

        match self
            .state
            .phase(self.config.warmup_epochs, self.config.cooldown_epochs, self.config.total_epochs)
        {
            Phase::Warmup | Phase::Cooldown => self.state.set_blocking_sync(),
            Phase::Cycling => {
                if self.state.epoch == self.config.warmup_epochs {
                    self.state.seed_cycling();
                    info!(epoch = self.state.epoch, "entering cycling phase");
                } else {
                    let stable = self.plateau.test_if_improving(averaged);
                    debug!(epoch = self.state.epoch, averaged, stable, "plateau check");
                    self.state.apply_plateau_transition(stable);
                }
            }
        }
        Ok(())
    }

    fn allreduce_mean_loss(&self, loss: f64) -> Result<f64> {
        let size = self.group.size().max(1) as usize;
        let rank = self.group.rank() as usize;
        let mut values = vec![0f64; size];
        values[rank] = loss;
        let mut bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.group.allreduce_sum(&mut bytes, &ReductionOp::NativeF64Sum)?;
        let sum: f64 = bytes
            .chunks_exact(8)
            .map(|chunk| f64::from_ne_bytes(chunk.try_into().unwrap()))
            .sum();
        Ok(sum / size as f64)
    }

    /// Runs one batch of the per-batch state machine.
    pub fn step(&mut self) -> Result<()> {
        self.step_underlying_optimizer();

        let last_batch = self
            .state
            .last_batch
            .ok_or_else(|| Error::Caller("last_batch not set before first step".into()))?;

        if self
            .state
            .phase(self.config.warmup_epochs, self.config.cooldown_epochs, self.config.total_epochs)
            != Phase::Cycling
        {
            self.state.set_blocking_sync();
        }

        let batch = self.state.current_batch;
        let g = self.state.global_skip;
        let ell = self.state.local_skip;
        let w = self.state.batches_to_wait;
        // Periodic hits are counted against the number of batches completed
        // *including this one* (batch + 1), not the raw zero-indexed batch
        // number: that is what makes the forced sync at `last_batch` coincide
        // with a periodic hit exactly when `g` divides the epoch length,
        // giving the closed-form sync count `⌈batches_per_epoch / g⌉` from
        // the two conditions together rather than double-counting the tail.
        let gmod = if g == 0 { 0 } else { (batch + 1) % g };
        let effective_wait = w.min(last_batch.saturating_sub(batch));

        if batch == last_batch || gmod == 0 {
            self.global_sync(effective_wait)?;
            return Ok(());
        }

        let next = batch + 1;
        let lmod = if ell == 0 { 0 } else { batch % ell };

        if g != 0 && next % g == 0 {
            self.local.set_local_sync(true);
            self.state.current_batch = next;
        } else if gmod < effective_wait {
            self.state.current_batch = next;
        } else if gmod == effective_wait {
            self.complete_previous_and_broadcast(self.state.send_mod_prev)?;
            if ell > 1 {
                self.local.set_local_sync(false);
            }
            self.state.current_batch = next;
        } else {
            self.local.set_local_sync(lmod != 0);
            self.state.current_batch = next;
        }

        if self.state.current_batch == last_batch {
            self.local.set_local_sync(true);
        }
        Ok(())
    }

    fn downcast_op(&self) -> ReductionOp {
        let custom = match self.config.downcast_type {
            DowncastType::Half => psyche_comm::reduction::f16_sum_op(),
            DowncastType::Bfloat16 => psyche_comm::reduction::bfloat16_sum_op(),
        };
        ReductionOp::Custom(custom)
    }

    fn global_sync(&mut self, effective_wait: u32) -> Result<()> {
        self.global_sync_count += 1;
        let m = self.state.send_mod;
        let last_batch = self.state.last_batch.unwrap();
        let is_last_batch = self.state.current_batch == last_batch;

        if self.local_subgroup_index == m {
            let cast = if self.state.global_skip < 1 {
                Some(self.downcast_type_kind())
            } else {
                None
            };
            let (buffer, layout) = {
                let model = self.model_mut()?;
                codec::pack(&model.named_parameters(), cast)
            };
            let op = if cast.is_some() {
                self.downcast_op()
            } else {
                ReductionOp::NativeF32Sum
            };
            let chunk_elems = self.config.sending_chunk_size;
            let elem_width = layout
                .entries
                .first()
                .map(|(_, s)| codec::byte_width(s.dtype))
                .unwrap_or(codec::byte_width(psyche_core::ScalarKind::Float32));
            let total_elems = buffer.len() / elem_width.max(1);

            let wait = if chunk_elems == 0 || total_elems <= chunk_elems {
                vec![self.subgroups[m as usize].allreduce_sum_nonblocking(buffer, op)?]
            } else {
                codec::split_into_chunks(&buffer, elem_width, chunk_elems)
                    .into_iter()
                    .map(|chunk| self.subgroups[m as usize].allreduce_sum_nonblocking(chunk, op.clone()))
                    .collect::<Result<Vec<_>>>()?
            };
            self.send_records[m as usize].occupy(SendRecord {
                wait,
                layout,
                batches_since_send: effective_wait,
            })?;
        }

        if effective_wait != 0 {
            self.complete_previous_and_broadcast(self.state.send_mod_prev)?;
        }

        if is_last_batch || effective_wait == 0 {
            self.complete_terminal(m)?;
        }

        self.state.send_mod_prev = m;
        let k = self.state.num_local_subgroups.max(1);
        self.state.send_mod = (m + 1) % k;

        if is_last_batch {
            self.state.send_mod = 0;
            self.state.epoch += 1;
            self.state.current_batch = 0;
        } else {
            self.state.current_batch += 1;
        }
        Ok(())
    }

    fn downcast_type_kind(&self) -> psyche_core::ScalarKind {
        match self.config.downcast_type {
            DowncastType::Half => psyche_core::ScalarKind::Float16,
            DowncastType::Bfloat16 => psyche_core::ScalarKind::Bfloat16,
        }
    }

    /// Completes the non-blocking reduction posted by subgroup `idx` on a
    /// prior call, unpacks it with the weighted blend (the non-terminal
    /// case), and locally broadcasts the result.
    fn complete_previous_and_broadcast(&mut self, idx: u32) -> Result<()> {
        let Some(mut record) = self.send_records[idx as usize].take() else {
            return Ok(());
        };
        let subgroup_size = self.subgroups[idx as usize].size().max(1) as f64;
        let b = record.batches_since_send;
        let numer = (2 * b).max(1) as f64;
        let denom = subgroup_size + numer;
        let alpha = numer / denom;

        let mut buffer = wait_all(record.wait)?;
        let layout = std::mem::take(&mut record.layout);
        let model = self.model_mut()?;
        codec::unpack_with_blend(&buffer, &layout, model, denom, alpha)?;
        self.local.broadcast(&mut buffer, idx as i32);
        Ok(())
    }

    /// Completes the just-posted reduction in its terminal form: `alpha =
    /// 0`, `denom = |subgroup|`, so the received average fully replaces the
    /// parameter.
    fn complete_terminal(&mut self, idx: u32) -> Result<()> {
        let Some(mut record) = self.send_records[idx as usize].take() else {
            return Ok(());
        };
        let denom = self.subgroups[idx as usize].size().max(1) as f64;
        let mut buffer = wait_all(record.wait)?;
        let layout = std::mem::take(&mut record.layout);
        let model = self.model_mut()?;
        codec::unpack_with_blend(&buffer, &layout, model, denom, 0.0)?;
        self.local.broadcast(&mut buffer, idx as i32);
        Ok(())
    }
}

/// Waits every handle of a (possibly chunked) send record, in order, and
/// concatenates the resulting buffers back into one contiguous buffer.
/// A single-handle record is the unchunked case.
fn wait_all(handles: Vec<Box<dyn psyche_comm::WaitHandle>>) -> Result<Vec<u8>> {
    let chunks = handles
        .into_iter()
        .map(|h| h.wait())
        .collect::<Result<Vec<_>>>()?;
    Ok(codec::concat_chunks(&chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use psyche_comm::testing;
    use psyche_modeling::NamedParameter;
    use pretty_assertions::assert_eq;
    use tch::Tensor;

    struct EmptyModel;

    impl NamedParameters for EmptyModel {
        fn named_parameters(&self) -> Vec<NamedParameter> {
            Vec::new()
        }
        fn get_parameter(&self, _name: &str) -> Option<Tensor> {
            None
        }
        fn set_parameter(&mut self, _name: &str, _value: &Tensor) {}
    }

    struct NoOpOptimizer;
    impl LocalOptimizer for NoOpOptimizer {
        fn step(&mut self) {}
    }

    fn make_controller(
        warmup: u32,
        cooldown: u32,
        total: u32,
        max_global_skips: u32,
    ) -> CadenceController<EmptyModel> {
        let group = testing::build(1).remove(0);
        let subgroup = testing::build(1).remove(0);
        let config = CadenceConfig {
            total_epochs: total,
            warmup_epochs: warmup,
            cooldown_epochs: cooldown,
            stability_level: 0.05,
            max_global_skips,
            sending_chunk_size: 10_000_000,
            downcast_type: DowncastType::Bfloat16,
            use_mpi_groups: true,
            verbose: false,
        };
        let mut controller = CadenceController::new(
            config,
            group,
            vec![subgroup],
            0,
            Box::new(crate::hooks::NoLocalParallel),
            Box::new(NoOpOptimizer),
        );
        controller.set_model(EmptyModel);
        controller
    }

    struct FakeModel {
        params: Vec<NamedParameter>,
    }

    impl NamedParameters for FakeModel {
        fn named_parameters(&self) -> Vec<NamedParameter> {
            self.params
                .iter()
                .map(|p| NamedParameter {
                    name: p.name.clone(),
                    tensor: p.tensor.shallow_clone(),
                    requires_grad: p.requires_grad,
                })
                .collect()
        }
        fn get_parameter(&self, name: &str) -> Option<Tensor> {
            self.params.iter().find(|p| p.name == name).map(|p| p.tensor.shallow_clone())
        }
        fn set_parameter(&mut self, name: &str, value: &Tensor) {
            if let Some(p) = self.params.iter_mut().find(|p| p.name == name) {
                p.tensor = value.shallow_clone();
            }
        }
    }

    #[test]
    fn chunked_send_reassembles_to_the_same_result_as_unchunked() {
        // Five f32 params (9 elements total) posted through a 2-element
        // chunk size should exercise split_into_chunks's remainder-first
        // layout and still round-trip exactly on a single-rank group, where
        // the allreduce is an identity.
        let group = testing::build(1).remove(0);
        let subgroup = testing::build(1).remove(0);
        let config = CadenceConfig {
            total_epochs: 1,
            warmup_epochs: 1,
            cooldown_epochs: 0,
            stability_level: 0.05,
            max_global_skips: 8,
            sending_chunk_size: 2,
            downcast_type: DowncastType::Bfloat16,
            use_mpi_groups: true,
            verbose: false,
        };
        let mut controller = CadenceController::new(
            config,
            group,
            vec![subgroup],
            0,
            Box::new(crate::hooks::NoLocalParallel),
            Box::new(NoOpOptimizer),
        );
        controller.set_model(FakeModel {
            params: vec![
                NamedParameter {
                    name: "a".into(),
                    tensor: Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]),
                    requires_grad: true,
                },
                NamedParameter {
                    name: "b".into(),
                    tensor: Tensor::from_slice(&[5.0f32, 6.0, 7.0, 8.0, 9.0]),
                    requires_grad: true,
                },
            ],
        });
        controller.set_last_batch(0);
        controller.step().unwrap();

        let a = controller.model().unwrap().get_parameter("a").unwrap();
        let mut out = vec![0f32; 4];
        a.copy_data(&mut out, 4);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn warmup_epoch_syncs_every_batch() {
        let mut controller = make_controller(2, 2, 10, 8);
        let batches_per_epoch = 16u32;
        controller.set_last_batch(batches_per_epoch - 1);
        for _ in 0..batches_per_epoch {
            controller.step().unwrap();
        }
        assert_eq!(controller.global_sync_count(), batches_per_epoch);
        assert_eq!(controller.state.epoch, 1);
    }

    #[test]
    fn cooldown_epoch_syncs_every_batch() {
        let mut controller = make_controller(0, 2, 2, 8);
        // drive straight into cooldown (warmup=0, total=2, cooldown=2 means
        // every epoch is cooldown)
        let batches_per_epoch = 16u32;
        controller.set_last_batch(batches_per_epoch - 1);
        for _ in 0..batches_per_epoch {
            controller.step().unwrap();
        }
        assert_eq!(controller.global_sync_count(), batches_per_epoch);
    }

    fn run_epoch(controller: &mut CadenceController<EmptyModel>, batches_per_epoch: u32, loss: f64) {
        controller.set_last_batch(batches_per_epoch - 1);
        for _ in 0..batches_per_epoch {
            controller.step().unwrap();
        }
        controller.epoch_loss_logic(loss, true).unwrap();
    }

    #[test]
    fn full_run_global_sync_count_matches_the_closed_form_law() {
        // warmup=2, cooldown=2, total=10, G_max=8, B=16 per epoch, with a
        // loss that stays flat after its first feed so
        // the plateau-driven cadence is fully deterministic: the very first
        // feed always counts as an improvement (best starts at +inf), then
        // three flat epochs trip stability (patience=2) and halve g twice,
        // then a fourth resets g to 1 and a fifth resets it to the ceiling.
        let mut controller = make_controller(2, 2, 10, 8);
        let batches = 16u32;

        // warmup: epochs 0, 1 - blocking every batch, 16 syncs each
        run_epoch(&mut controller, batches, 1.0);
        run_epoch(&mut controller, batches, 1.0);
        // epoch 2: seeded g=4,l=1,w=1 on the boundary into cycling -> 4 syncs
        run_epoch(&mut controller, batches, 1.0);
        // epoch 3: first plateau feed, best was +inf so not stable -> g=4 -> 4 syncs
        run_epoch(&mut controller, batches, 1.0);
        // epoch 4: flat loss, bad_epoch 1/2 -> still g=4 -> 4 syncs
        run_epoch(&mut controller, batches, 1.0);
        // epoch 5: flat loss, bad_epoch 2/2 -> still g=4 -> 4 syncs
        run_epoch(&mut controller, batches, 1.0);
        // epoch 6: bad_epoch 3 trips stability -> g halves to 2 -> 8 syncs
        run_epoch(&mut controller, batches, 1.0);
        // epoch 7: stable again -> g halves to 1 -> 16 syncs
        run_epoch(&mut controller, batches, 1.0);
        // boundary into epoch 8 is cooldown (epoch >= total - cooldown = 8),
        // so the g=1 stable->ceiling reset never triggers here; cooldown
        // forces blocking regardless.
        run_epoch(&mut controller, batches, 1.0);
        run_epoch(&mut controller, batches, 1.0);

        let warmup_and_cooldown = batches * 4; // epochs 0,1,8,9
        let cycling = 4 * batches.div_ceil(4) // epochs 2,3,4,5 at g=4
            + batches.div_ceil(2) // epoch 6 at g=2
            + batches.div_ceil(1); // epoch 7 at g=1
        assert_eq!(
            controller.global_sync_count(),
            warmup_and_cooldown + cycling
        );
        assert_eq!(controller.global_sync_count(), 104);
    }

    #[test]
    fn g_equals_one_and_stable_resets_to_the_ceiling_on_the_next_epoch_boundary() {
        // warmup=1, cooldown=0 so training never leaves cycling once it
        // starts, letting g walk 4 -> 2 -> 1 -> G_max across flat-loss
        // epoch boundaries.
        let mut controller = make_controller(1, 0, 8, 8);
        let batches = 16u32;

        run_epoch(&mut controller, batches, 1.0); // warmup epoch 0
        assert_eq!(controller.state.global_skip, 4); // seeded entering cycling

        run_epoch(&mut controller, batches, 1.0); // epoch 1: first feed, not stable
        assert_eq!(controller.state.global_skip, 4);
        run_epoch(&mut controller, batches, 1.0); // epoch 2: bad epoch 1/2
        assert_eq!(controller.state.global_skip, 4);
        run_epoch(&mut controller, batches, 1.0); // epoch 3: bad epoch 2/2
        assert_eq!(controller.state.global_skip, 4);
        run_epoch(&mut controller, batches, 1.0); // epoch 4: bad epoch 3 trips -> halve to 2
        assert_eq!(controller.state.global_skip, 2);
        run_epoch(&mut controller, batches, 1.0); // epoch 5: bad epoch 4 trips -> halve to 1
        assert_eq!(controller.state.global_skip, 1);
        run_epoch(&mut controller, batches, 1.0); // epoch 6: bad epoch 5 trips, g was 1 -> reset to ceiling
        assert_eq!(controller.state.global_skip, 8);
        assert_eq!(controller.state.local_skip, 2);
        assert_eq!(controller.state.batches_to_wait, 2);
    }
}
