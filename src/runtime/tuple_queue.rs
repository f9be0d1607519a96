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
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::common::ids::WorkerId;
use crate::exec::chunk::Chunk;
use crate::exec::{ExecError, ExecResult};
use crate::funnel_logging::debug;
use crate::runtime::latch::Latch;

/// Result of a non-blocking poll on one tuple channel.
///
/// `Empty` is the normal backpressure case and distinct from `Done`: a reader
/// transitions to `Done` exactly once, on the channel's end-of-stream marker,
/// never on mere absence of data.
#[derive(Debug)]
pub enum ReadResult {
    Chunk(Chunk),
    Empty,
    Done,
}

/// Accounting collected on the reader side of one channel. Harvested when the
/// reader is destroyed, before the owning pool shuts down, so worker-side work
/// is fully attributable.
#[derive(Clone, Debug, Default)]
pub struct ReaderStats {
    pub chunks: u64,
    pub rows: u64,
}

struct QueueState {
    chunks: VecDeque<Chunk>,
    done: bool,
    fault: Option<String>,
    detached: bool,
}

struct TupleQueue {
    mu: Mutex<QueueState>,
    space: Condvar,
    capacity: usize,
}

impl TupleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            mu: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                done: false,
                fault: None,
                detached: false,
            }),
            space: Condvar::new(),
            capacity: capacity.max(1),
        }
    }
}

/// Shared coordination region for one gather generation: one bounded tuple
/// queue per launched worker plus the latch the coordinator blocks on. Owned
/// by the worker pool handle; readers and senders only borrow into it.
pub struct GatherSegment {
    queues: Vec<Arc<TupleQueue>>,
    latch: Arc<Latch>,
    canceled: AtomicBool,
    finish_requested: AtomicBool,
}

impl GatherSegment {
    pub fn new(workers: usize, queue_capacity: usize, latch: Arc<Latch>) -> Arc<Self> {
        let queues = (0..workers)
            .map(|_| Arc::new(TupleQueue::new(queue_capacity)))
            .collect();
        Arc::new(Self {
            queues,
            latch,
            canceled: AtomicBool::new(false),
            finish_requested: AtomicBool::new(false),
        })
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    pub fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.latch)
    }

    fn queue(&self, worker: WorkerId) -> ExecResult<Arc<TupleQueue>> {
        self.queues
            .get(worker.as_u32() as usize)
            .cloned()
            .ok_or_else(|| {
                ExecError::InvariantViolation(format!(
                    "worker {} out of range for segment of {} queues",
                    worker,
                    self.queues.len()
                ))
            })
    }

    pub fn sender(self: &Arc<Self>, worker: WorkerId) -> ExecResult<WorkerSender> {
        Ok(WorkerSender {
            queue: self.queue(worker)?,
            segment: Arc::clone(self),
            worker,
            finished: false,
        })
    }

    pub fn reader(self: &Arc<Self>, worker: WorkerId) -> ExecResult<ChannelReader> {
        Ok(ChannelReader {
            queue: self.queue(worker)?,
            worker,
            done_observed: false,
            stats: ReaderStats::default(),
        })
    }

    /// Tear the segment down: blocked senders abort, pending data is dropped.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        for queue in &self.queues {
            let mut st = queue.mu.lock().unwrap_or_else(|e| e.into_inner());
            st.detached = true;
            queue.space.notify_all();
            drop(st);
        }
        self.latch.signal();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Ask workers to wrap up after their current chunk. Advisory; workers
    /// poll this between pushes and still send their end-of-stream marker.
    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::Release);
        self.latch.signal();
    }

    pub fn finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::Acquire)
    }
}

/// Worker-side handle to one tuple queue. Pushes block while the queue is at
/// capacity; `finish` publishes the end-of-stream marker. Dropping the sender
/// without finishing marks the channel faulted, so a worker that dies
/// mid-stream surfaces as a hard failure on the reader side.
pub struct WorkerSender {
    queue: Arc<TupleQueue>,
    segment: Arc<GatherSegment>,
    worker: WorkerId,
    finished: bool,
}

/// Returned when a push can no longer be delivered (reader detached or the
/// segment was canceled). Workers stop producing quietly.
#[derive(Debug)]
pub struct SendAborted;

impl WorkerSender {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn finish_requested(&self) -> bool {
        self.segment.finish_requested()
    }

    pub fn push(&mut self, chunk: Chunk) -> Result<(), SendAborted> {
        let mut st = self.queue.mu.lock().unwrap_or_else(|e| e.into_inner());
        while st.chunks.len() >= self.queue.capacity && !st.detached {
            st = self
                .queue
                .space
                .wait(st)
                .unwrap_or_else(|e| e.into_inner());
        }
        if st.detached || self.segment.is_canceled() {
            return Err(SendAborted);
        }
        st.chunks.push_back(chunk);
        drop(st);
        self.segment.latch.signal();
        Ok(())
    }

    pub fn finish(mut self) {
        self.mark_done(None);
    }

    pub fn fault(mut self, message: String) {
        self.mark_done(Some(message));
    }

    fn mark_done(&mut self, fault: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut st = self.queue.mu.lock().unwrap_or_else(|e| e.into_inner());
        match fault {
            Some(message) => st.fault = Some(message),
            None => st.done = true,
        }
        drop(st);
        self.segment.latch.signal();
    }
}

impl Drop for WorkerSender {
    fn drop(&mut self) {
        if !self.finished {
            self.mark_done(Some(format!(
                "worker {} exited without end-of-stream",
                self.worker
            )));
        }
    }
}

/// Reader-side handle to one inbound tuple channel. `try_next` never blocks;
/// `Done` is terminal and polling past it is an invariant violation.
pub struct ChannelReader {
    queue: Arc<TupleQueue>,
    worker: WorkerId,
    done_observed: bool,
    stats: ReaderStats,
}

impl ChannelReader {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn try_next(&mut self) -> ExecResult<ReadResult> {
        if self.done_observed {
            return Err(ExecError::InvariantViolation(format!(
                "tuple channel reader for worker {} polled after done",
                self.worker
            )));
        }
        let mut st = self.queue.mu.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(message) = st.fault.clone() {
            return Err(ExecError::ChannelFault(message));
        }
        if let Some(chunk) = st.chunks.pop_front() {
            self.queue.space.notify_one();
            drop(st);
            self.stats.chunks += 1;
            self.stats.rows += chunk.len() as u64;
            return Ok(ReadResult::Chunk(chunk));
        }
        if st.done {
            drop(st);
            self.done_observed = true;
            return Ok(ReadResult::Done);
        }
        Ok(ReadResult::Empty)
    }

    /// Sever the borrow into the segment and hand back the accounting.
    pub fn destroy(mut self) -> ReaderStats {
        self.detach();
        std::mem::take(&mut self.stats)
    }

    fn detach(&mut self) {
        let mut st = self.queue.mu.lock().unwrap_or_else(|e| e.into_inner());
        if st.detached {
            return;
        }
        st.detached = true;
        if !st.chunks.is_empty() {
            debug!(
                "tuple channel reader for worker {} dropped {} undelivered chunks",
                self.worker,
                st.chunks.len()
            );
            st.chunks.clear();
        }
        self.queue.space.notify_all();
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn int_chunk(values: &[i32]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("v", DataType::Int32, false),
            SlotId::new(1),
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
            .expect("record batch");
        Chunk::try_new(batch).expect("chunk")
    }

    fn one_worker_segment(capacity: usize) -> Arc<GatherSegment> {
        GatherSegment::new(1, capacity, Arc::new(Latch::new()))
    }

    #[test]
    fn reader_sees_chunks_then_done() {
        let segment = one_worker_segment(4);
        let mut sender = segment.sender(WorkerId::new(0)).expect("sender");
        let mut reader = segment.reader(WorkerId::new(0)).expect("reader");

        sender.push(int_chunk(&[1])).expect("push");
        sender.push(int_chunk(&[2, 3])).expect("push");
        sender.finish();

        assert!(matches!(
            reader.try_next().expect("poll"),
            ReadResult::Chunk(_)
        ));
        assert!(matches!(
            reader.try_next().expect("poll"),
            ReadResult::Chunk(_)
        ));
        assert!(matches!(reader.try_next().expect("poll"), ReadResult::Done));

        let stats = reader.destroy();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.rows, 3);
    }

    #[test]
    fn empty_is_not_done() {
        let segment = one_worker_segment(4);
        let _sender = segment.sender(WorkerId::new(0)).expect("sender");
        let mut reader = segment.reader(WorkerId::new(0)).expect("reader");
        assert!(matches!(reader.try_next().expect("poll"), ReadResult::Empty));
        assert!(matches!(reader.try_next().expect("poll"), ReadResult::Empty));
    }

    #[test]
    fn poll_after_done_is_invariant_violation() {
        let segment = one_worker_segment(4);
        let sender = segment.sender(WorkerId::new(0)).expect("sender");
        sender.finish();

        let mut reader = segment.reader(WorkerId::new(0)).expect("reader");
        assert!(matches!(reader.try_next().expect("poll"), ReadResult::Done));
        let err = reader.try_next().expect_err("expected invariant violation");
        assert!(matches!(err, ExecError::InvariantViolation(_)));
    }

    #[test]
    fn sender_dropped_without_finish_faults_channel() {
        let segment = one_worker_segment(4);
        let sender = segment.sender(WorkerId::new(0)).expect("sender");
        drop(sender);

        let mut reader = segment.reader(WorkerId::new(0)).expect("reader");
        let err = reader.try_next().expect_err("expected channel fault");
        assert!(matches!(err, ExecError::ChannelFault(_)));
    }

    #[test]
    fn push_blocks_at_capacity_until_reader_pops() {
        let segment = one_worker_segment(1);
        let mut sender = segment.sender(WorkerId::new(0)).expect("sender");
        let mut reader = segment.reader(WorkerId::new(0)).expect("reader");

        sender.push(int_chunk(&[1])).expect("push");

        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            sender.push(int_chunk(&[2])).expect("second push");
            let _ = tx.send(());
            sender.finish();
        });

        // The second push cannot land while the queue is full.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert!(matches!(
            reader.try_next().expect("poll"),
            ReadResult::Chunk(_)
        ));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().expect("join sender");
    }

    #[test]
    fn cancel_aborts_blocked_sender() {
        let segment = one_worker_segment(1);
        let mut sender = segment.sender(WorkerId::new(0)).expect("sender");
        sender.push(int_chunk(&[1])).expect("push");

        let cancel_segment = Arc::clone(&segment);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel_segment.cancel();
        });

        assert!(sender.push(int_chunk(&[2])).is_err());
        handle.join().expect("join canceler");
        sender.finish();
    }
}
