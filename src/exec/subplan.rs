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

use crate::common::ids::WorkerId;
use crate::exec::chunk::Chunk;
use crate::exec::{ExecError, ExecResult};

/// Per-execution flags handed to a sub-plan at open time.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExecFlags {
    /// Parallel mode is active; a gather node may fire up workers.
    pub allow_parallel: bool,
}

/// Pull interface of an executable sub-plan.
///
/// The gather node consumes this both for its local fallback copy and, through
/// the worker pool, for the per-worker copies. Calls follow the usual executor
/// protocol: `open` once, `next` until it yields `None`, `rescan` to re-arm,
/// `close` exactly once at the end.
pub trait PlanExec: Send {
    fn open(&mut self, flags: ExecFlags) -> ExecResult<()>;
    fn next(&mut self) -> ExecResult<Option<Chunk>>;
    fn rescan(&mut self) -> ExecResult<()>;
    fn close(&mut self);
}

pub type BoxedPlanExec = Box<dyn PlanExec>;

/// Produces an independent copy of the sub-plan for one worker. A
/// parallel-aware sub-plan partitions its input across copies (including the
/// leader's local copy); a single-copy plan need not be parallel-aware.
pub type PlanExecFactory = Arc<dyn Fn(WorkerId) -> BoxedPlanExec + Send + Sync>;

/// Materialized sub-plan that replays a fixed list of chunks. Used by tests
/// and as the trivial leaf of demo plans.
pub struct ValuesExec {
    chunks: Vec<Chunk>,
    cursor: usize,
    opened: bool,
}

impl ValuesExec {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            cursor: 0,
            opened: false,
        }
    }
}

impl PlanExec for ValuesExec {
    fn open(&mut self, _flags: ExecFlags) -> ExecResult<()> {
        self.cursor = 0;
        self.opened = true;
        Ok(())
    }

    fn next(&mut self) -> ExecResult<Option<Chunk>> {
        if !self.opened {
            return Err(ExecError::InvariantViolation(
                "values exec polled before open".to_string(),
            ));
        }
        if self.cursor >= self.chunks.len() {
            return Ok(None);
        }
        let chunk = self.chunks[self.cursor].clone();
        self.cursor += 1;
        Ok(Some(chunk))
    }

    fn rescan(&mut self) -> ExecResult<()> {
        self.cursor = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }
}
