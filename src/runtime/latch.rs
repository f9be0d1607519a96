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
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Generation-counter latch. Producers bump the counter whenever something
/// happened that a waiter might care about (tuple queued, end-of-stream,
/// teardown); the waiter compares counter values so a signal raised between
/// observing the counter and going to sleep is never lost.
pub struct Latch {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn current(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn signal(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        *generation = generation.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Block until the counter moves past `seen` or `step` elapses, whichever
    /// comes first, and return the counter observed on wakeup. Callers are
    /// expected to re-check their cancel flag between steps and retry.
    pub fn wait_for_change(&self, seen: u64, step: Duration) -> u64 {
        let generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        if *generation != seen {
            return *generation;
        }
        let (generation, _timeout) = self
            .cv
            .wait_timeout_while(generation, step, |g| *g == seen)
            .unwrap_or_else(|e| e.into_inner());
        *generation
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
