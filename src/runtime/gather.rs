// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Gather coordinator: fans one sub-plan out to a pool of parallel workers,
//! merges their tuple channels with an optional local copy of the plan, and
//! serves the result as a single pull-based stream.
//!
//! Workers are launched lazily on the first `next` call of a generation, so
//! the shared segment is only allocated when the node actually runs. The
//! merge keeps draining one channel until it would block and rotates on
//! `Empty`, sweeping every live channel once before falling back to the local
//! copy or blocking on the segment latch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::config;
use crate::exec::chunk::Chunk;
use crate::exec::node::gather::GatherNode;
use crate::exec::subplan::{BoxedPlanExec, ExecFlags};
use crate::exec::{ExecError, ExecResult};
use crate::funnel_logging::debug;
use crate::runtime::cancel::CancelFlag;
use crate::runtime::latch::Latch;
use crate::runtime::reader_ring::{ReaderRing, RingStats};
use crate::runtime::tuple_queue::ReadResult;
use crate::runtime::worker_pool::{WorkerPool, WorkerPoolInit};

/// Observable coarse state of the coordinator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GatherPhase {
    Uninitialized,
    Active,
    Draining,
    Exhausted,
}

/// Per-generation fetch accounting, in the spirit of the executor's
/// `enable_statistic` counters: tuples pulled from workers and the cumulative
/// time spent fetching them.
#[derive(Clone, Debug, Default)]
pub struct GatherStats {
    pub get_tuples: u64,
    pub get_total_time: Duration,
}

/// Thin wrapper over the sub-plan's pull interface, used when remote sources
/// are unavailable or exhausted.
struct LocalScanner {
    plan: BoxedPlanExec,
}

impl LocalScanner {
    fn open(&mut self, flags: ExecFlags) -> ExecResult<()> {
        self.plan.open(flags)
    }

    fn pull(&mut self) -> ExecResult<Option<Chunk>> {
        self.plan.next()
    }

    fn rescan(&mut self) -> ExecResult<()> {
        self.plan.rescan()
    }

    fn close(&mut self) {
        self.plan.close()
    }
}

pub struct GatherExec {
    node: GatherNode,
    local: LocalScanner,
    pool_init: WorkerPoolInit,
    pool: Option<Box<dyn WorkerPool>>,
    cancel: CancelFlag,
    flags: ExecFlags,
    opened: bool,
    closed: bool,

    // Runtime state, re-armed (not reallocated) on rescan.
    initialized: bool,
    launched_workers: u32,
    ring: ReaderRing,
    initial_readers: usize,
    need_scan_locally: bool,
    local_exhausted: bool,
    dispatch_waited: bool,
    funnel: Option<Chunk>,
    latch: Option<Arc<Latch>>,
    collected: RingStats,
    stats: Option<GatherStats>,
    force_statistic: bool,
}

impl GatherExec {
    pub fn new(node: GatherNode, local_plan: BoxedPlanExec, pool_init: WorkerPoolInit) -> Self {
        Self {
            node,
            local: LocalScanner { plan: local_plan },
            pool_init,
            pool: None,
            cancel: CancelFlag::new(),
            flags: ExecFlags::default(),
            opened: false,
            closed: false,
            initialized: false,
            launched_workers: 0,
            ring: ReaderRing::empty(),
            initial_readers: 0,
            need_scan_locally: false,
            local_exhausted: false,
            dispatch_waited: false,
            funnel: None,
            latch: None,
            collected: RingStats::default(),
            stats: None,
            force_statistic: false,
        }
    }

    /// Collect fetch statistics regardless of the config knob.
    pub fn with_statistic(mut self) -> Self {
        self.force_statistic = true;
        self
    }

    /// Handle for cancelling this node from another thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn launched_workers(&self) -> u32 {
        self.launched_workers
    }

    pub fn stats(&self) -> Option<&GatherStats> {
        self.stats.as_ref()
    }

    pub fn needs_local_scan(&self) -> bool {
        self.need_scan_locally
    }

    pub fn phase(&self) -> GatherPhase {
        if !self.initialized {
            return GatherPhase::Uninitialized;
        }
        if self.node.send_only {
            if self.dispatch_waited {
                return GatherPhase::Exhausted;
            }
            return GatherPhase::Active;
        }
        if self.ring.is_empty() && !self.need_scan_locally {
            return GatherPhase::Exhausted;
        }
        if self.ring.len() < self.initial_readers || self.local_exhausted {
            return GatherPhase::Draining;
        }
        GatherPhase::Active
    }

    pub fn open(&mut self, flags: ExecFlags) -> ExecResult<()> {
        if self.opened {
            return Err(ExecError::InvariantViolation(
                "gather node opened twice".to_string(),
            ));
        }
        self.flags = flags;
        self.local.open(flags)?;
        self.opened = true;
        Ok(())
    }

    /// Return the next merged chunk, or `None` at end of stream. Launches
    /// workers on the first call of a generation.
    pub fn next(&mut self) -> ExecResult<Option<Chunk>> {
        if !self.opened {
            return Err(ExecError::InvariantViolation(
                "gather node polled before open".to_string(),
            ));
        }
        self.cancel.check()?;

        if !self.initialized {
            self.initialize()?;
        }

        // Invalidate the staged tuple before anything else so a buffer from
        // the previous cycle can never be returned twice.
        self.funnel = None;

        if self.node.send_only {
            if !self.dispatch_waited {
                if let Some(pool) = self.pool.as_ref() {
                    pool.wait_all_done(&self.cancel)?;
                }
                self.dispatch_waited = true;
                debug!(
                    "gather node {}: send-only dispatch complete, {} workers",
                    self.node.node_id, self.launched_workers
                );
            }
            return Ok(None);
        }

        let timed = self.stats.is_some() && !self.need_scan_locally;
        let begin = timed.then(Instant::now);

        let chunk = self.get_next_merged()?;

        match chunk {
            Some(chunk) => {
                if let (Some(stats), Some(begin)) = (self.stats.as_mut(), begin) {
                    stats.get_tuples += 1;
                    stats.get_total_time += begin.elapsed();
                }
                self.funnel = Some(chunk);
                Ok(self.funnel.take())
            }
            None => {
                if let Some(stats) = self.stats.as_ref() {
                    let avg_us = if stats.get_tuples == 0 {
                        0.0
                    } else {
                        stats.get_total_time.as_micros() as f64 / stats.get_tuples as f64
                    };
                    debug!(
                        "gather node {}: get_tuples={} get_total_time={:?} avg_us={:.2}",
                        self.node.node_id, stats.get_tuples, stats.get_total_time, avg_us
                    );
                }
                Ok(None)
            }
        }
    }

    /// Initialize the worker pool and readers on first execution of a
    /// generation. Launch shortfall (including zero workers) is absorbed by
    /// falling back to the local copy of the plan.
    fn initialize(&mut self) -> ExecResult<()> {
        self.launched_workers = 0;
        self.initial_readers = 0;
        self.collected = RingStats::default();

        if self.node.requested_workers > 0 && self.flags.allow_parallel {
            if self.pool.is_none() {
                self.pool = Some((self.pool_init)()?);
            }
            let Some(pool) = self.pool.as_mut() else {
                return Err(ExecError::InvariantViolation(
                    "worker pool missing after init".to_string(),
                ));
            };

            let launched = pool.launch(self.node.requested_workers)?;
            self.launched_workers = launched;
            if launched < self.node.requested_workers {
                debug!(
                    "gather node {}: launch shortfall, requested={} launched={}",
                    self.node.node_id, self.node.requested_workers, launched
                );
            }

            if launched == 0 {
                // No workers? Then never mind.
                pool.shutdown();
                self.need_scan_locally = true;
            } else if self.node.send_only {
                self.need_scan_locally = false;
            } else {
                let readers = pool.make_readers()?;
                self.initial_readers = readers.len();
                self.ring = ReaderRing::new(readers);
                self.latch = Some(pool.latch());
                // A non-single-copy plan is parallel-aware and partitions
                // work across copies including the leader's.
                self.need_scan_locally = !self.node.single_copy;
            }
        } else {
            self.need_scan_locally = true;
        }

        if self.node.send_only {
            self.need_scan_locally = false;
        }

        self.local_exhausted = false;
        self.dispatch_waited = false;
        self.stats = (self.force_statistic || config::enable_statistic())
            .then(GatherStats::default);
        self.initialized = true;
        Ok(())
    }

    /// Merge loop: prefer the worker channels, fall back to the local copy of
    /// the plan, end the stream once both are exhausted.
    fn get_next_merged(&mut self) -> ExecResult<Option<Chunk>> {
        while !self.ring.is_empty() || self.need_scan_locally {
            self.cancel.check()?;

            if !self.ring.is_empty()
                && let Some(chunk) = self.read_from_workers()?
            {
                return Ok(Some(chunk));
            }

            if self.need_scan_locally {
                match self.local.pull()? {
                    Some(chunk) => return Ok(Some(chunk)),
                    None => {
                        self.need_scan_locally = false;
                        self.local_exhausted = true;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Attempt to read one chunk from the worker channels without blocking
    /// more than necessary. Returns `None` when the caller should consult the
    /// local scan instead (full empty sweep while the local copy is still
    /// live) or when every channel finished.
    fn read_from_workers(&mut self) -> ExecResult<Option<Chunk>> {
        let step = Duration::from_millis(config::gather_wait_step_ms().max(1));
        let latch = self.latch.clone();
        let mut latch_seen = latch.as_ref().map(|l| l.current()).unwrap_or(0);
        let mut visited = 0usize;

        loop {
            self.cancel.check()?;

            match self.ring.poll_current()? {
                ReadResult::Chunk(chunk) => return Ok(Some(chunk)),
                ReadResult::Done => {
                    let stats = self.ring.remove_current();
                    self.collected.absorb(&stats);
                    if self.ring.is_empty() {
                        // All channels drained; stop the workers now so their
                        // accounting is complete before the stream ends.
                        self.shutdown_workers();
                        return Ok(None);
                    }
                    continue;
                }
                ReadResult::Empty => {}
            }

            // Only reached without a chunk from the current channel: rotate,
            // and after a full empty sweep either hand off to the local scan
            // or wait for developments.
            self.ring.advance();
            visited += 1;
            if visited >= self.ring.len() {
                if self.need_scan_locally {
                    return Ok(None);
                }
                let Some(latch) = latch.as_ref() else {
                    return Err(ExecError::InvariantViolation(
                        "gather wait with no latch".to_string(),
                    ));
                };
                loop {
                    self.cancel.check()?;
                    let now = latch.wait_for_change(latch_seen, step);
                    if now != latch_seen {
                        latch_seen = now;
                        break;
                    }
                }
                visited = 0;
            }
        }
    }

    /// Destroy remaining readers (collecting their accounting) and stop the
    /// workers. Readers must go first or worker-side work is undercounted.
    /// Idempotent.
    pub fn shutdown_workers(&mut self) {
        if !self.ring.is_empty() {
            let stats = self.ring.dispose();
            self.collected.readers += stats.readers;
            self.collected.chunks += stats.chunks;
            self.collected.rows += stats.rows;
        }
        if self.collected.readers > 0 {
            debug!(
                "gather node {}: {} readers destroyed, {} chunks / {} rows received",
                self.node.node_id, self.collected.readers, self.collected.chunks, self.collected.rows
            );
            self.collected = RingStats::default();
        }
        self.latch = None;
        if let Some(pool) = self.pool.as_mut() {
            pool.shutdown();
        }
    }

    /// Re-arm for a fresh scan: stop workers gracefully, keep the pool (and
    /// its segment) for reuse, and rescan the sub-plan unconditionally.
    pub fn rescan(&mut self) -> ExecResult<()> {
        self.shutdown_workers();
        self.initialized = false;
        if let Some(pool) = self.pool.as_mut() {
            pool.reinitialize()?;
        }
        debug!(
            "gather node {}: rescan (param={:?})",
            self.node.node_id, self.node.rescan_param
        );
        self.local.rescan()
    }

    /// Tear the node down: workers, then the pool's shared segment, then the
    /// sub-plan. Safe to call multiple times.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.shutdown_workers();
        if let Some(pool) = self.pool.as_mut() {
            pool.cleanup();
        }
        self.local.close();
        self.closed = true;
    }

    /// Force full consumption without taking output, guaranteeing worker-side
    /// effects have completed before returning. Asks workers to wrap up
    /// early, then drains the stream.
    pub fn drain_to_completion(&mut self) -> ExecResult<()> {
        if !self.opened {
            return Err(ExecError::InvariantViolation(
                "gather node drained before open".to_string(),
            ));
        }
        if let Some(pool) = self.pool.as_ref() {
            pool.request_early_finish();
        }
        while self.next()?.is_some() {}
        Ok(())
    }
}
