//! An in-process [`ProcessGroup`] for exercising multi-rank algorithms
//! (principally the ring distance engine and cadence controller) without an
//! MPI runtime. Each rank runs on its own OS thread; point-to-point
//! messages travel over `std::sync::mpsc` channels, matched by `(peer,
//! tag)` the same way a real transport matches by tag, with an unmatched-
//! message holding area so probes/receives for a later tag don't consume a
//! message meant for an earlier one.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use psyche_core::{Error, Result};

use crate::reduction::ReductionOp;
use crate::{ProcessGroup, WaitHandle};

struct Message {
    from: i32,
    tag: i32,
    bytes: Vec<u8>,
}

/// A full in-process group: one [`InProcessGroup`] handle per rank, plus
/// the shared inboxes every handle sends into.
pub struct InProcessGroup {
    rank: i32,
    size: i32,
    senders: Vec<Sender<Message>>,
    inbox: Mutex<Receiver<Message>>,
    pending: Mutex<VecDeque<Message>>,
}

/// Builds `size` linked [`InProcessGroup`] handles, one per simulated rank.
pub fn build(size: usize) -> Vec<Arc<InProcessGroup>> {
    assert!(size > 0, "process group size must be positive");
    let mut senders = Vec::with_capacity(size);
    let mut receivers = Vec::with_capacity(size);
    for _ in 0..size {
        let (tx, rx) = mpsc::channel();
        senders.push(tx);
        receivers.push(rx);
    }
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, rx)| {
            Arc::new(InProcessGroup {
                rank: rank as i32,
                size: size as i32,
                senders: senders.clone(),
                inbox: Mutex::new(rx),
                pending: Mutex::new(VecDeque::new()),
            })
        })
        .collect()
}

impl InProcessGroup {
    /// Blocks until a message matching `(peer, tag)` is available, without
    /// removing it from the pending area.
    fn wait_for_match(&self, peer: i32, tag: i32) -> Result<()> {
        loop {
            {
                let pending = self.pending.lock().unwrap();
                if pending.iter().any(|m| m.from == peer && m.tag == tag) {
                    return Ok(());
                }
            }
            let msg = self
                .inbox
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| Error::Transport("peer channel closed".into()))?;
            self.pending.lock().unwrap().push_back(msg);
        }
    }

    fn take_match(&self, peer: i32, tag: i32) -> Message {
        let mut pending = self.pending.lock().unwrap();
        let idx = pending
            .iter()
            .position(|m| m.from == peer && m.tag == tag)
            .expect("caller already confirmed a match is pending");
        pending.remove(idx).unwrap()
    }
}

struct ResolvedHandle(Vec<u8>);

impl WaitHandle for ResolvedHandle {
    fn wait(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(self.0)
    }
}

impl ProcessGroup for InProcessGroup {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn subgroup(&self, _ranks: &[i32]) -> Result<Arc<dyn ProcessGroup>> {
        // Building a genuinely re-threaded subgroup would require access to
        // the sibling handles this rank doesn't own; tests that need
        // subgroup behavior build a second, independent `build()` group of
        // the right size instead.
        Err(Error::InternalInvariantViolation(
            "InProcessGroup does not support in-place subgroup construction; build a second group instead".into(),
        ))
    }

    fn send(&self, buf: &[u8], peer: i32, tag: i32) -> Result<()> {
        self.senders[peer as usize]
            .send(Message {
                from: self.rank,
                tag,
                bytes: buf.to_vec(),
            })
            .map_err(|_| Error::Transport("peer channel closed".into()))
    }

    fn probe(&self, peer: i32, tag: i32) -> Result<usize> {
        self.wait_for_match(peer, tag)?;
        let pending = self.pending.lock().unwrap();
        let msg = pending
            .iter()
            .find(|m| m.from == peer && m.tag == tag)
            .expect("just confirmed by wait_for_match");
        Ok(msg.bytes.len())
    }

    fn recv(&self, peer: i32, tag: i32, byte_len: usize) -> Result<Vec<u8>> {
        self.wait_for_match(peer, tag)?;
        let msg = self.take_match(peer, tag);
        if msg.bytes.len() != byte_len {
            return Err(Error::InternalInvariantViolation(format!(
                "expected {byte_len} bytes from rank {peer} on tag {tag}, got {}",
                msg.bytes.len()
            )));
        }
        Ok(msg.bytes)
    }

    fn allreduce_sum(&self, buf: &mut [u8], op: &ReductionOp) -> Result<()> {
        // Ring-reduce around all ranks using the same point-to-point
        // primitives: simple and sufficient for tests, which never run
        // large groups.
        let tag = i32::MAX - 1;
        let mut acc = buf.to_vec();
        if self.rank != 0 {
            self.send(&acc, 0, tag)?;
        } else {
            for peer in 1..self.size {
                let len = self.probe(peer, tag)?;
                let incoming = self.recv(peer, tag, len)?;
                apply_op(&incoming, &mut acc, op);
            }
        }
        if self.rank == 0 {
            for peer in 1..self.size {
                self.send(&acc, peer, tag)?;
            }
        } else {
            let len = self.probe(0, tag)?;
            acc = self.recv(0, tag, len)?;
        }
        buf.copy_from_slice(&acc);
        Ok(())
    }

    fn allreduce_sum_nonblocking(
        &self,
        mut buf: Vec<u8>,
        op: ReductionOp,
    ) -> Result<Box<dyn WaitHandle>> {
        self.allreduce_sum(&mut buf, &op)?;
        Ok(Box::new(ResolvedHandle(buf)))
    }
}

fn apply_op(src: &[u8], dst: &mut [u8], op: &ReductionOp) {
    match op {
        ReductionOp::NativeF32Sum => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let a = f32::from_ne_bytes(d.try_into().unwrap());
                let b = f32::from_ne_bytes(s.try_into().unwrap());
                d.copy_from_slice(&(a + b).to_ne_bytes());
            }
        }
        ReductionOp::NativeF64Sum => {
            for (d, s) in dst.chunks_exact_mut(8).zip(src.chunks_exact(8)) {
                let a = f64::from_ne_bytes(d.try_into().unwrap());
                let b = f64::from_ne_bytes(s.try_into().unwrap());
                d.copy_from_slice(&(a + b).to_ne_bytes());
            }
        }
        ReductionOp::Custom(custom) => (custom.apply)(src, dst),
    }
}
