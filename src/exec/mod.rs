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
pub mod chunk;
pub mod node;
pub mod subplan;

use thiserror::Error;

/// Execution-layer error taxonomy.
///
/// A launch shortfall (fewer workers than requested, possibly zero) is not an
/// error: the gather node degrades to whatever launched and never surfaces it.
/// Everything below propagates to the caller unmodified and is never retried
/// internally.
#[derive(Error, Debug)]
pub enum ExecError {
    /// A tuple channel reported a transport-level failure distinct from normal
    /// end-of-stream, e.g. a worker that died mid-stream.
    #[error("channel fault: {0}")]
    ChannelFault(String),

    /// The external cancel flag was observed while polling or waiting.
    #[error("execution cancelled")]
    Cancelled,

    /// Internal bug guard; indicates a defect in the coordinator itself.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type ExecResult<T> = Result<T, ExecError>;
