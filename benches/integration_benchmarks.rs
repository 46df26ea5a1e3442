//! Connection setup benchmarks against a live Postgres
//!
//! These measure what a caller pays before the first query:
//! - Direct connect with a fixed sslmode
//! - `sslmode=preferred` probing (one real login per candidate)
//! - Connect through the loopback tunnel entry and an in-process SOCKS5 relay
//!
//! Requires a reachable server, configured through the environment:
//! - `FRAISEQL_BENCH_URL` (default `postgres://postgres@localhost:5432/postgres`)
//!
//! Run with: cargo bench --bench integration_benchmarks --features bench-with-postgres

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fraiseql_tunnel::client::{ConnectionNegotiator, ConnectionOptions, ProxyConfig};
use fraiseql_tunnel::connection::{PostgresDriver, SslMode};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

fn bench_url() -> String {
    std::env::var("FRAISEQL_BENCH_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost:5432/postgres".to_string())
}

/// Minimal no-auth SOCKS5 relay that ignores the requested address and dials `upstream`
async fn spawn_relay(upstream: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                client.read_exact(&mut greeting).await?;
                let mut methods = vec![0u8; greeting[1] as usize];
                client.read_exact(&mut methods).await?;
                client.write_all(&[5, 0]).await?;

                let mut request = [0u8; 4];
                client.read_exact(&mut request).await?;
                let skip = match request[3] {
                    1 => 4,
                    4 => 16,
                    _ => client.read_u8().await? as usize,
                };
                let mut rest = vec![0u8; skip + 2];
                client.read_exact(&mut rest).await?;

                let mut server = TcpStream::connect(upstream).await?;
                client.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await?;
                tokio::io::copy_bidirectional(&mut client, &mut server).await?;
                Ok::<_, std::io::Error>(())
            });
        }
    });
    addr
}

// ============================================================================
// Direct Connection Benchmarks
// ============================================================================

fn direct_benchmarks(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let negotiator = ConnectionNegotiator::new(PostgresDriver::new());
    let url = bench_url();

    let mut group = c.benchmark_group("direct_connect");
    group.measurement_time(std::time::Duration::from_secs(10));
    group.sample_size(20);

    for mode in [SslMode::Disabled, SslMode::Preferred] {
        group.bench_with_input(BenchmarkId::from_parameter(mode), &mode, |b, &mode| {
            b.to_async(&runtime).iter(|| async {
                let options = ConnectionOptions::from_uri(url.clone()).ssl_mode(mode);
                let established = negotiator.connect(options).await.unwrap();
                negotiator.close(established).await.unwrap();
            });
        });
    }

    group.finish();
}

// ============================================================================
// Tunnelled Connection Benchmarks
// ============================================================================

fn tunnel_benchmarks(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let negotiator = ConnectionNegotiator::new(PostgresDriver::new());
    let url = bench_url();

    let target = ConnectionOptions::from_uri(url.clone()).resolve().unwrap();
    let upstream: SocketAddr = runtime
        .block_on(tokio::net::lookup_host((target.host.as_str(), target.port)))
        .unwrap()
        .next()
        .unwrap();
    let relay = runtime.block_on(spawn_relay(upstream));

    let mut group = c.benchmark_group("tunnelled_connect");
    group.measurement_time(std::time::Duration::from_secs(10));
    group.sample_size(20);

    group.bench_function("socks5_disabled", |b| {
        b.to_async(&runtime).iter(|| async {
            let options = ConnectionOptions::from_uri(url.clone())
                .ssl_mode(SslMode::Disabled)
                .proxy(ProxyConfig::new("127.0.0.1", relay.port()));
            let established = negotiator.connect(options).await.unwrap();
            negotiator.close(established).await.unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, direct_benchmarks, tunnel_benchmarks);
criterion_main!(benches);
