// Copyright 2025 Meshline Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

/// Point-in-time export of one cluster's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatsSnapshot {
    pub cluster: String,
    pub upstream_requests_total: u64,
    pub lb_no_available_host: u64,
    pub health_check_failures: u64,
    pub health_check_recoveries: u64,
    pub pool_connections_created: u64,
    pub pool_connect_failures: u64,
    pub healthy_hosts: u64,
    pub total_hosts: u64,
}

/// Export of every registered cluster, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub clusters: Vec<ClusterStatsSnapshot>,
}
