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

//! End-to-end gather scenarios over a real thread-backed worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{Int32Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use funnel::GatherExec;
use funnel::common::ids::{SlotId, WorkerId};
use funnel::exec::ExecResult;
use funnel::exec::chunk::{Chunk, field_with_slot_id};
use funnel::exec::node::gather::GatherNode;
use funnel::exec::subplan::{BoxedPlanExec, ExecFlags, PlanExec, PlanExecFactory, ValuesExec};
use funnel::runtime::worker_pool::{ThreadWorkerPool, WorkerPoolInit, WorkerSink};

fn int_chunk(values: &[i32]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![field_with_slot_id(
        Field::new("v", DataType::Int32, false),
        SlotId::new(1),
    )]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
        .expect("record batch");
    Chunk::try_new(batch).expect("chunk")
}

fn chunk_values(chunk: &Chunk) -> Vec<i32> {
    let col = chunk.column_by_slot_id(SlotId::new(1)).expect("column");
    let ints = col
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column");
    (0..ints.len()).map(|i| ints.value(i)).collect()
}

/// One single-value chunk per listed value, per worker slot.
fn per_worker_factory(per_worker: Vec<Vec<i32>>) -> PlanExecFactory {
    Arc::new(move |worker: WorkerId| {
        let values = per_worker
            .get(worker.as_u32() as usize)
            .cloned()
            .unwrap_or_default();
        let chunks = values.iter().map(|v| int_chunk(&[*v])).collect();
        Box::new(ValuesExec::new(chunks)) as BoxedPlanExec
    })
}

fn pool_init_with(factory: PlanExecFactory, threads: usize) -> WorkerPoolInit {
    let mut slot = Some(factory);
    Box::new(move || {
        let factory = slot.take().expect("factory consumed once per pool");
        Ok(Box::new(ThreadWorkerPool::with_threads(factory, threads, 8))
            as Box<dyn funnel::runtime::worker_pool::WorkerPool>)
    })
}

fn parallel() -> ExecFlags {
    ExecFlags {
        allow_parallel: true,
    }
}

fn drain_sorted(gather: &mut GatherExec) -> Vec<i32> {
    let mut rows = Vec::new();
    while let Some(chunk) = gather.next().expect("next") {
        rows.extend(chunk_values(&chunk));
    }
    rows.sort_unstable();
    rows
}

struct CountingValues {
    inner: ValuesExec,
    pulls: Arc<AtomicUsize>,
}

impl PlanExec for CountingValues {
    fn open(&mut self, flags: ExecFlags) -> ExecResult<()> {
        self.inner.open(flags)
    }

    fn next(&mut self) -> ExecResult<Option<Chunk>> {
        self.pulls.fetch_add(1, Ordering::AcqRel);
        self.inner.next()
    }

    fn rescan(&mut self) -> ExecResult<()> {
        self.inner.rescan()
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

#[test]
fn gather_merges_short_launch_with_local_fallback() {
    // Three workers planned, but the pool only has two threads; the local
    // copy of the plan picks up its own share regardless.
    let factory = per_worker_factory(vec![vec![1, 2], vec![3]]);
    let node = GatherNode::new(7, 3);
    let local = Box::new(ValuesExec::new(vec![int_chunk(&[4]), int_chunk(&[5])]));
    let mut gather = GatherExec::new(node, local, pool_init_with(factory, 2));

    gather.open(parallel()).expect("open");
    assert_eq!(drain_sorted(&mut gather), vec![1, 2, 3, 4, 5]);
    assert!(gather.launched_workers() <= 2);
    assert!(gather.next().expect("after eos").is_none());
    gather.close();
}

#[test]
fn single_copy_runs_in_exactly_one_place() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let factory = per_worker_factory(vec![vec![10, 11, 12]]);
    let node = GatherNode::new(7, 1).with_single_copy(true);
    let local = Box::new(CountingValues {
        inner: ValuesExec::new(vec![int_chunk(&[99])]),
        pulls: Arc::clone(&pulls),
    });
    let mut gather = GatherExec::new(node, local, pool_init_with(factory, 2));

    gather.open(parallel()).expect("open");
    assert_eq!(drain_sorted(&mut gather), vec![10, 11, 12]);
    // The local copy was never pulled; the worker's copy is authoritative.
    assert_eq!(pulls.load(Ordering::Acquire), 0);
    gather.close();
}

#[test]
fn zero_workers_degrades_to_plain_local_scan() {
    let factory = per_worker_factory(vec![]);
    let node = GatherNode::new(7, 0);
    let local = Box::new(ValuesExec::new(vec![int_chunk(&[1]), int_chunk(&[2])]));
    let mut gather = GatherExec::new(node, local, pool_init_with(factory, 2));

    gather.open(parallel()).expect("open");
    assert_eq!(drain_sorted(&mut gather), vec![1, 2]);
    assert_eq!(gather.launched_workers(), 0);
    gather.close();
}

#[test]
fn rescan_replays_the_whole_stream() {
    let factory = per_worker_factory(vec![vec![1], vec![2]]);
    let node = GatherNode::new(7, 2);
    let local = Box::new(ValuesExec::new(vec![int_chunk(&[3])]));
    let mut gather = GatherExec::new(node, local, pool_init_with(factory, 4));

    gather.open(parallel()).expect("open");
    assert_eq!(drain_sorted(&mut gather), vec![1, 2, 3]);

    gather.rescan().expect("rescan");
    assert_eq!(drain_sorted(&mut gather), vec![1, 2, 3]);
    gather.close();
}

#[test]
fn close_after_partial_consumption_is_clean() {
    let factory = per_worker_factory(vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
    let node = GatherNode::new(7, 2);
    let local = Box::new(ValuesExec::new(vec![int_chunk(&[9])]));
    let mut gather = GatherExec::new(node, local, pool_init_with(factory, 4));

    gather.open(parallel()).expect("open");
    // Take one chunk, then abandon the stream.
    assert!(gather.next().expect("next").is_some());
    gather.close();
    gather.close();
}

struct CollectingSink {
    rows: Mutex<Vec<i32>>,
}

impl WorkerSink for CollectingSink {
    fn consume(&self, _worker: WorkerId, chunk: Chunk) -> ExecResult<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.extend(chunk_values(&chunk));
        Ok(())
    }
}

#[test]
fn send_only_dispatches_and_yields_nothing() {
    let sink = Arc::new(CollectingSink {
        rows: Mutex::new(Vec::new()),
    });
    let factory = per_worker_factory(vec![vec![1, 2], vec![3]]);
    let sink_for_pool = Arc::clone(&sink);
    let mut slot = Some(factory);
    let pool_init: WorkerPoolInit = Box::new(move || {
        let factory = slot.take().expect("factory consumed once per pool");
        let pool = ThreadWorkerPool::with_threads(factory, 4, 8)
            .with_sink(Arc::clone(&sink_for_pool) as Arc<dyn WorkerSink>);
        Ok(Box::new(pool) as Box<dyn funnel::runtime::worker_pool::WorkerPool>)
    });

    let node = GatherNode::new(7, 2).with_send_only(true);
    let local = Box::new(ValuesExec::new(vec![int_chunk(&[99])]));
    let mut gather = GatherExec::new(node, local, pool_init);

    gather.open(parallel()).expect("open");
    // The first call blocks until dispatch completes, then the stream is
    // empty; the local copy never runs.
    assert!(gather.next().expect("next").is_none());
    assert!(gather.next().expect("next again").is_none());

    let mut rows = sink.rows.lock().expect("rows").clone();
    rows.sort_unstable();
    assert_eq!(rows, vec![1, 2, 3]);
    gather.close();
}

#[test]
fn drain_to_completion_consumes_everything() {
    let factory = per_worker_factory(vec![vec![1], vec![2]]);
    let node = GatherNode::new(7, 2);
    let local = Box::new(ValuesExec::new(vec![int_chunk(&[3])]));
    let mut gather = GatherExec::new(node, local, pool_init_with(factory, 4));

    gather.open(parallel()).expect("open");
    gather.drain_to_completion().expect("drain");
    assert!(gather.next().expect("after drain").is_none());
    gather.close();
}

#[test]
fn parallel_forbidden_at_open_runs_locally() {
    let factory = per_worker_factory(vec![vec![1]]);
    let node = GatherNode::new(7, 2);
    let local = Box::new(ValuesExec::new(vec![int_chunk(&[8])]));
    let mut gather = GatherExec::new(node, local, pool_init_with(factory, 2));

    gather
        .open(ExecFlags {
            allow_parallel: false,
        })
        .expect("open");
    assert_eq!(drain_sorted(&mut gather), vec![8]);
    assert_eq!(gather.launched_workers(), 0);
    gather.close();
}
