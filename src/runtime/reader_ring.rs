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
use crate::exec::{ExecError, ExecResult};
use crate::runtime::tuple_queue::{ChannelReader, ReadResult, ReaderStats};

/// Ordered collection of live channel readers with a round-robin cursor.
///
/// The cursor only moves on an explicit `advance`, so the merge keeps draining
/// one producer until it would block and switches queues on `Empty`, not per
/// tuple. Removal compacts in place and clamps the cursor, preserving
/// round-robin order over the survivors.
pub struct ReaderRing {
    readers: Vec<ChannelReader>,
    cursor: usize,
}

impl ReaderRing {
    pub fn new(readers: Vec<ChannelReader>) -> Self {
        Self { readers, cursor: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn poll_current(&mut self) -> ExecResult<ReadResult> {
        let cursor = self.cursor;
        match self.readers.get_mut(cursor) {
            Some(reader) => reader.try_next(),
            None => Err(ExecError::InvariantViolation(
                "reader ring polled while empty".to_string(),
            )),
        }
    }

    /// Remove and destroy the reader at the cursor, returning its accounting.
    /// The survivors keep their relative order and the cursor lands on the
    /// next reader in round-robin sequence (wrapping to the front).
    pub fn remove_current(&mut self) -> ReaderStats {
        if self.cursor >= self.readers.len() {
            return ReaderStats::default();
        }
        let reader = self.readers.remove(self.cursor);
        if self.cursor >= self.readers.len() {
            self.cursor = 0;
        }
        reader.destroy()
    }

    pub fn advance(&mut self) {
        if self.readers.is_empty() {
            return;
        }
        self.cursor = (self.cursor + 1) % self.readers.len();
    }

    /// Destroy every remaining reader, aggregating their accounting. Used at
    /// shutdown; readers must be gone before the pool is shut down.
    pub fn dispose(&mut self) -> RingStats {
        let mut total = RingStats::default();
        for reader in self.readers.drain(..) {
            let stats = reader.destroy();
            total.readers += 1;
            total.chunks += stats.chunks;
            total.rows += stats.rows;
        }
        self.cursor = 0;
        total
    }

}

/// Aggregated accounting over destroyed readers.
#[derive(Clone, Debug, Default)]
pub struct RingStats {
    pub readers: u64,
    pub chunks: u64,
    pub rows: u64,
}

impl RingStats {
    pub fn absorb(&mut self, stats: &ReaderStats) {
        self.readers += 1;
        self.chunks += stats.chunks;
        self.rows += stats.rows;
    }
}
