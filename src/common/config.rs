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
use crate::funnel_config::config as funnel_app_config;

pub(crate) fn gather_wait_step_ms() -> u64 {
    funnel_app_config()
        .ok()
        .map(|c| c.runtime.gather_wait_step_ms)
        .unwrap_or(50)
}

pub(crate) fn tuple_queue_capacity() -> usize {
    funnel_app_config()
        .ok()
        .map(|c| c.runtime.tuple_queue_capacity)
        .unwrap_or(64)
}

pub(crate) fn worker_pool_threads() -> usize {
    funnel_app_config()
        .ok()
        .map(|c| c.runtime.worker_pool_threads)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn enable_statistic() -> bool {
    funnel_app_config()
        .ok()
        .map(|c| c.runtime.enable_statistic)
        .unwrap_or(false)
}
