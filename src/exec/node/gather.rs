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
use crate::common::ids::ParamId;

/// Plan-side configuration of a gather node, fixed at plan-compile time.
///
/// A gather launches parallel workers to run copies of the same sub-plan and
/// merges their outputs with an optional local copy into one stream. With
/// `single_copy` set it runs the plan in exactly one worker and does not
/// execute it locally unless no worker could be obtained. With `send_only`
/// set the workers push results directly to the final destination and the
/// node degenerates into dispatch-and-wait.
#[derive(Clone, Debug)]
pub struct GatherNode {
    pub node_id: i32,
    pub requested_workers: u32,
    pub single_copy: bool,
    pub send_only: bool,
    pub rescan_param: Option<ParamId>,
}

impl GatherNode {
    pub fn new(node_id: i32, requested_workers: u32) -> Self {
        Self {
            node_id,
            requested_workers,
            single_copy: false,
            send_only: false,
            rescan_param: None,
        }
    }

    pub fn with_single_copy(mut self, single_copy: bool) -> Self {
        self.single_copy = single_copy;
        self
    }

    pub fn with_send_only(mut self, send_only: bool) -> Self {
        self.send_only = send_only;
        self
    }

    pub fn with_rescan_param(mut self, param: ParamId) -> Self {
        self.rescan_param = Some(param);
        self
    }

    pub fn profile_name(&self) -> String {
        format!("GATHER (id={})", self.node_id)
    }
}
