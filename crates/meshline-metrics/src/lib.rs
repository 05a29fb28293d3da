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

//! Meshline Upstream Statistics
//!
//! Thread-safe counters for the upstream core. The hot path (request
//! handlers picking hosts, pools opening streams) only touches lock-free
//! atomics; the registry lock is taken when a cluster is created or removed
//! and when a snapshot is exported.
//!
//! # Components
//!
//! - [`ClusterStats`]: per-cluster atomic counters and gauges
//! - [`MetricsRegistry`]: cluster-name keyed storage
//! - [`ClusterStatsSnapshot`] / [`RegistrySnapshot`]: serializable exports
//!   for an admin surface or log line

mod registry;
mod snapshot;

pub use registry::{ClusterStats, MetricsRegistry};
pub use snapshot::{ClusterStatsSnapshot, RegistrySnapshot};
