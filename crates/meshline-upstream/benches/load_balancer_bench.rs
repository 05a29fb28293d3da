// Criterion benchmarks for meshline-upstream
//
// Run benchmarks with:
//   cargo bench -p meshline-upstream
//
// For detailed output with plots:
//   cargo bench -p meshline-upstream -- --save-baseline main

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use meshline_common::{ClusterConfig, HostConfig, LbContext};
use meshline_metrics::ClusterStats;
use meshline_upstream::cluster::ClusterInfo;
use meshline_upstream::load_balancer::{
    LeastRequestLoadBalancer, LoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer,
    WeightedRoundRobinLoadBalancer,
};
use meshline_upstream::{Host, PrioritySet};

fn priority_set(n: usize) -> Arc<PrioritySet> {
    let info = ClusterInfo::from_config(&ClusterConfig::new("bench"), Arc::new(ClusterStats::new()));
    let hosts: Vec<Arc<Host>> = (0..n)
        .map(|i| {
            Host::new(
                HostConfig::new(format!("127.0.0.1:{}", 10000 + i)).with_weight((i % 7 + 1) as u32),
                Arc::clone(&info),
            )
            .unwrap()
        })
        .collect();
    let ps = PrioritySet::new();
    ps.update_hosts(0, hosts);
    ps
}

fn bench_choose_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("choose_host");
    let ctx = LbContext::new();

    for &n in &[2usize, 10, 50] {
        let ps = priority_set(n);

        group.bench_with_input(BenchmarkId::new("round_robin", n), &n, |b, _| {
            let lb = RoundRobinLoadBalancer::new(Arc::clone(&ps));
            b.iter(|| black_box(lb.choose_host(&ctx)));
        });

        group.bench_with_input(BenchmarkId::new("random", n), &n, |b, _| {
            let lb = RandomLoadBalancer::new(Arc::clone(&ps));
            b.iter(|| black_box(lb.choose_host(&ctx)));
        });

        group.bench_with_input(BenchmarkId::new("weighted_round_robin", n), &n, |b, _| {
            let lb = WeightedRoundRobinLoadBalancer::new(Arc::clone(&ps));
            b.iter(|| black_box(lb.choose_host(&ctx)));
        });

        group.bench_with_input(BenchmarkId::new("least_request", n), &n, |b, _| {
            let lb = LeastRequestLoadBalancer::new(Arc::clone(&ps));
            b.iter(|| black_box(lb.choose_host(&ctx)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_choose_host);
criterion_main!(benches);
