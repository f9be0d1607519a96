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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::config;
use crate::common::ids::WorkerId;
use crate::exec::chunk::Chunk;
use crate::exec::subplan::{ExecFlags, PlanExec, PlanExecFactory};
use crate::exec::{ExecError, ExecResult};
use crate::funnel_logging::{debug, warn};
use crate::runtime::cancel::CancelFlag;
use crate::runtime::latch::Latch;
use crate::runtime::tuple_queue::{ChannelReader, GatherSegment, WorkerSender};

/// Shared status region the pool publishes worker progress into: how many
/// workers actually launched, whether setup completed, and how many have
/// finished. Readable by downstream telemetry.
pub struct WorkerPoolStatus {
    launched: AtomicU32,
    setup_done: AtomicBool,
    finished: AtomicU32,
}

impl WorkerPoolStatus {
    pub fn new() -> Self {
        Self {
            launched: AtomicU32::new(0),
            setup_done: AtomicBool::new(false),
            finished: AtomicU32::new(0),
        }
    }

    pub fn launched(&self) -> u32 {
        self.launched.load(Ordering::Acquire)
    }

    pub fn setup_done(&self) -> bool {
        self.setup_done.load(Ordering::Acquire)
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::Acquire)
    }

    fn publish_launched(&self, launched: u32) {
        self.launched.store(launched, Ordering::Release);
        self.setup_done.store(true, Ordering::Release);
    }

    fn worker_finished(&self) {
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    fn reset(&self) {
        self.launched.store(0, Ordering::Release);
        self.setup_done.store(false, Ordering::Release);
        self.finished.store(0, Ordering::Release);
    }
}

impl Default for WorkerPoolStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination workers write to in send-only mode, bypassing the reader merge.
pub trait WorkerSink: Send + Sync {
    fn consume(&self, worker: WorkerId, chunk: Chunk) -> ExecResult<()>;
}

/// Lifecycle handle over a set of launched parallel workers and their shared
/// coordination segment.
///
/// `launch` may return fewer workers than requested, including zero; that is a
/// degraded-but-valid state, not an error. `shutdown` is idempotent;
/// `reinitialize` re-arms the shared state for a rescan without reallocating;
/// `cleanup` releases the segment for good and is called once at node close.
pub trait WorkerPool: Send {
    fn launch(&mut self, requested: u32) -> ExecResult<u32>;

    /// One reader per launched worker. Only called when the node merges
    /// worker output (never in send-only mode), and at most once per launch.
    fn make_readers(&mut self) -> ExecResult<Vec<ChannelReader>>;

    fn reinitialize(&mut self) -> ExecResult<()>;

    fn shutdown(&mut self);

    fn cleanup(&mut self);

    /// Advisory flag asking workers to wrap up after their current chunk.
    fn request_early_finish(&self);

    /// Block until every launched worker reported completion. Returns
    /// immediately when nothing was launched. Cancel-aware.
    fn wait_all_done(&self, cancel: &CancelFlag) -> ExecResult<()>;

    fn latch(&self) -> Arc<Latch>;

    fn status(&self) -> Arc<WorkerPoolStatus>;
}

/// Deferred pool construction; invoked on the first `next` call of a
/// generation so the shared segment is only allocated when really needed.
pub type WorkerPoolInit = Box<dyn FnMut() -> ExecResult<Box<dyn WorkerPool>> + Send>;

/// In-process worker pool running sub-plan copies on a thread pool, the
/// process-pool analogue for a single-node deployment. Spare thread capacity
/// bounds how many workers a launch can obtain, which is where launch
/// shortfall comes from.
pub struct ThreadWorkerPool {
    threads: ThreadPool,
    factory: PlanExecFactory,
    sink: Option<Arc<dyn WorkerSink>>,
    segment: Option<Arc<GatherSegment>>,
    status: Arc<WorkerPoolStatus>,
    latch: Arc<Latch>,
    queue_capacity: usize,
    wait_step: Duration,
    launched: u32,
    readers_made: bool,
}

impl ThreadWorkerPool {
    pub fn new(factory: PlanExecFactory) -> Self {
        Self::with_threads(
            factory,
            config::worker_pool_threads(),
            config::tuple_queue_capacity(),
        )
    }

    pub fn with_threads(factory: PlanExecFactory, threads: usize, queue_capacity: usize) -> Self {
        Self {
            threads: ThreadPool::new(threads.max(1)),
            factory,
            sink: None,
            segment: None,
            status: Arc::new(WorkerPoolStatus::new()),
            latch: Arc::new(Latch::new()),
            queue_capacity,
            wait_step: Duration::from_millis(config::gather_wait_step_ms()),
            launched: 0,
            readers_made: false,
        }
    }

    /// Route worker output to `sink` instead of the tuple queues (send-only
    /// plans).
    pub fn with_sink(mut self, sink: Arc<dyn WorkerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Convenience builder for the coordinator's deferred-construction slot.
    pub fn init(factory: PlanExecFactory) -> WorkerPoolInit {
        let mut slot = Some(factory);
        Box::new(move || {
            let factory = slot.take().ok_or_else(|| {
                ExecError::InvariantViolation("worker pool initialized twice".to_string())
            })?;
            Ok(Box::new(ThreadWorkerPool::new(factory)) as Box<dyn WorkerPool>)
        })
    }

    fn spawn_queue_worker(&self, worker: WorkerId, sender: WorkerSender) {
        let mut plan = (self.factory)(worker);
        let status = Arc::clone(&self.status);
        let latch = Arc::clone(&self.latch);
        self.threads.execute(move || {
            run_queue_worker(plan.as_mut(), sender, worker);
            plan.close();
            status.worker_finished();
            latch.signal();
        });
    }

    fn spawn_sink_worker(&self, worker: WorkerId, sink: Arc<dyn WorkerSink>, segment: Arc<GatherSegment>) {
        let mut plan = (self.factory)(worker);
        let status = Arc::clone(&self.status);
        let latch = Arc::clone(&self.latch);
        self.threads.execute(move || {
            run_sink_worker(plan.as_mut(), sink.as_ref(), segment.as_ref(), worker);
            plan.close();
            status.worker_finished();
            latch.signal();
        });
    }
}

fn run_queue_worker(plan: &mut dyn PlanExec, mut sender: WorkerSender, worker: WorkerId) {
    let result: ExecResult<()> = (|| {
        plan.open(ExecFlags {
            allow_parallel: true,
        })?;
        loop {
            if sender.finish_requested() {
                break;
            }
            match plan.next()? {
                Some(chunk) => {
                    if sender.push(chunk).is_err() {
                        debug!("worker {} stopping: channel detached", worker);
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(())
    })();
    match result {
        Ok(()) => sender.finish(),
        Err(e) => {
            warn!("worker {} failed: {}", worker, e);
            sender.fault(format!("worker {} failed: {}", worker, e));
        }
    }
}

fn run_sink_worker(
    plan: &mut dyn PlanExec,
    sink: &dyn WorkerSink,
    segment: &GatherSegment,
    worker: WorkerId,
) {
    let result: ExecResult<()> = (|| {
        plan.open(ExecFlags {
            allow_parallel: true,
        })?;
        loop {
            if segment.finish_requested() || segment.is_canceled() {
                break;
            }
            match plan.next()? {
                Some(chunk) => sink.consume(worker, chunk)?,
                None => break,
            }
        }
        Ok(())
    })();
    if let Err(e) = result {
        // No queue to fault into; completion accounting still advances.
        warn!("send-only worker {} failed: {}", worker, e);
    }
}

impl WorkerPool for ThreadWorkerPool {
    fn launch(&mut self, requested: u32) -> ExecResult<u32> {
        if self.segment.is_some() {
            return Err(ExecError::InvariantViolation(
                "worker pool launched twice without shutdown".to_string(),
            ));
        }
        let spare = self
            .threads
            .max_count()
            .saturating_sub(self.threads.active_count());
        let launched = requested.min(u32::try_from(spare).unwrap_or(u32::MAX));
        if launched == 0 {
            debug!(
                "worker pool launch: requested={} launched=0 (no spare threads)",
                requested
            );
            self.launched = 0;
            return Ok(0);
        }

        let segment = GatherSegment::new(
            launched as usize,
            self.queue_capacity,
            Arc::clone(&self.latch),
        );
        self.segment = Some(Arc::clone(&segment));
        self.readers_made = false;

        for i in 0..launched {
            let worker = WorkerId::new(i);
            match self.sink.as_ref() {
                Some(sink) => {
                    self.spawn_sink_worker(worker, Arc::clone(sink), Arc::clone(&segment))
                }
                None => {
                    let sender = segment.sender(worker)?;
                    self.spawn_queue_worker(worker, sender);
                }
            }
        }

        self.status.publish_launched(launched);
        self.launched = launched;
        debug!(
            "worker pool launch: requested={} launched={}",
            requested, launched
        );
        Ok(launched)
    }

    fn make_readers(&mut self) -> ExecResult<Vec<ChannelReader>> {
        let Some(segment) = self.segment.as_ref() else {
            return Err(ExecError::InvariantViolation(
                "make_readers called before launch".to_string(),
            ));
        };
        if self.readers_made {
            return Err(ExecError::InvariantViolation(
                "make_readers called twice for one launch".to_string(),
            ));
        }
        self.readers_made = true;
        (0..self.launched)
            .map(|i| segment.reader(WorkerId::new(i)))
            .collect()
    }

    fn reinitialize(&mut self) -> ExecResult<()> {
        if self.segment.is_some() {
            self.shutdown();
        }
        self.status.reset();
        self.readers_made = false;
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(segment) = self.segment.take() else {
            return;
        };
        let launched = self.launched;
        self.launched = 0;
        segment.cancel();

        // Wait for workers to exit so all their work is accounted before the
        // caller inspects or resets the status region.
        let mut seen = self.latch.current();
        while self.status.finished() < launched {
            seen = self.latch.wait_for_change(seen, self.wait_step);
        }
        debug!("worker pool shutdown: {} workers finished", launched);
    }

    fn cleanup(&mut self) {
        self.shutdown();
    }

    fn request_early_finish(&self) {
        if let Some(segment) = self.segment.as_ref() {
            segment.request_finish();
        }
    }

    fn wait_all_done(&self, cancel: &CancelFlag) -> ExecResult<()> {
        if self.segment.is_none() {
            return Ok(());
        }
        let mut seen = self.latch.current();
        while self.status.finished() < self.launched {
            cancel.check()?;
            seen = self.latch.wait_for_change(seen, self.wait_step);
        }
        Ok(())
    }

    fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.latch)
    }

    fn status(&self) -> Arc<WorkerPoolStatus> {
        Arc::clone(&self.status)
    }
}
