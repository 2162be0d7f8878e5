//! `SimpleDataParallelOptimizer`: a simpler, non-adaptive sibling coordinator
//! to [`crate::CadenceController`]. It skips the warmup/cycling/cooldown
//! cadence entirely and either blocks on every step's gradient reduction or
//! posts a single non-blocking one per step, with no plateau detection and
//! no local/global two-tier split.

use std::sync::Arc;

use psyche_comm::{ProcessGroup, ReductionOp};
use psyche_core::Result;
use psyche_modeling::codec;
use psyche_modeling::NamedParameters;

use crate::hooks::LocalOptimizer;

pub struct SimpleDataParallelOptimizer<M: NamedParameters> {
    group: Arc<dyn ProcessGroup>,
    model: M,
    optimizer: Box<dyn LocalOptimizer>,
    /// When `true`, `step()` blocks on the gradient-equivalent parameter
    /// reduction before returning; when `false`, it posts the reduction
    /// non-blockingly and completes it at the start of the *next* call.
    blocking: bool,
    pending: Option<(Box<dyn psyche_comm::WaitHandle>, codec::Layout)>,
}

impl<M: NamedParameters> SimpleDataParallelOptimizer<M> {
    pub fn new(
        group: Arc<dyn ProcessGroup>,
        model: M,
        optimizer: Box<dyn LocalOptimizer>,
        blocking: bool,
    ) -> Self {
        Self {
            group,
            model,
            optimizer,
            blocking,
            pending: None,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn step(&mut self) -> Result<()> {
        if let Some((wait, layout)) = self.pending.take() {
            let buffer = wait.wait()?;
            let denom = self.group.size().max(1) as f64;
            codec::unpack_with_blend(&buffer, &layout, &mut self.model, denom, 0.0)?;
        }

        self.optimizer.step();

        let (buffer, layout) = codec::pack(&self.model.named_parameters(), None);
        if self.blocking {
            let mut buffer = buffer;
            self.group
                .allreduce_sum(&mut buffer, &ReductionOp::NativeF32Sum)?;
            let denom = self.group.size().max(1) as f64;
            codec::unpack_with_blend(&buffer, &layout, &mut self.model, denom, 0.0)?;
        } else {
            let wait = self
                .group
                .allreduce_sum_nonblocking(buffer, ReductionOp::NativeF32Sum)?;
            self.pending = Some((wait, layout));
        }
        Ok(())
    }
}
