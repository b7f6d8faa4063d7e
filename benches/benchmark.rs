//! Connection Server Performance Benchmark Suite
//!
//! This module contains benchmarks for measuring the hot paths of the
//! connection server:
//! - Deserialization filter decision throughput
//! - Connect/disconnect cycle cost through the registry critical section

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;
use uuid::Uuid;

use remote_server_rs::config::ServerConfiguration;
use remote_server_rs::server::filter::{AllowListFilter, DeserializationFilter, PatternFilter};
use remote_server_rs::server::{ConnectionRequest, PluginRegistry, Server, SessionService, User};

fn filter_benchmark(c: &mut Criterion) {
    let allowlist = AllowListFilter::new(["com.acme.Foo", "com.acme.pkg.*"]);
    c.bench_function("allowlist_check", |b| {
        b.iter(|| allowlist.check(black_box("com.acme.pkg.Bar")))
    });
    c.bench_function("allowlist_check_rejected", |b| {
        b.iter(|| allowlist.check(black_box("com.other.Baz")))
    });

    let pattern = PatternFilter::compile("maxdepth=20;com.acme.*;!*").unwrap();
    c.bench_function("pattern_check", |b| {
        b.iter(|| pattern.check(black_box("com.acme.pkg.Bar[][]")))
    });
}

fn connect_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let server = rt.block_on(async {
        Server::start(
            ServerConfiguration::builder(0).build(),
            SessionService::new(Duration::from_secs(600)),
            &PluginRegistry::new(),
        )
        .await
        .unwrap()
    });

    c.bench_function("connect_disconnect_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                let client_id = Uuid::new_v4();
                let request = ConnectionRequest::new(
                    User::new("bench", "bench"),
                    client_id,
                    "bench-client",
                );
                server.connect(request).await.unwrap();
                server.disconnect(client_id).await;
            })
        })
    });

    rt.block_on(server.shutdown());
}

criterion_group!(benches, filter_benchmark, connect_benchmark);
criterion_main!(benches);
