//! # Queued Connection Benchmark Harness
//!
//! Purpose: Drive SET/GET round-trips through one `QueuedConnection` against a
//! Redis-compatible responder and report throughput plus a latency histogram.
//!
//! Usage: `nsock-bench [host:port] [ops] [value_size] [config.json]`
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: A fixed PRNG seed keeps key choice stable.
//! 2. **Allocation Control**: Requests are pre-built off the hot path.
//! 3. **Sequential by Construction**: The connection answers in order, so each
//!    round-trip is timed from enqueue to settlement.

mod metrics;

use std::env;
use std::fs;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use nsock_client::{ConnectionConfig, QueuedConnection, Request, resp};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::metrics::{LatencyHistogram, LatencySnapshot};

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_OP_COUNT: usize = 10_000;
const DEFAULT_VALUE_SIZE: usize = 64;
const KEY_COUNT: usize = 1_024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

struct BenchConfig {
    connection: ConnectionConfig,
    op_count: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        let mut connection = match args.next() {
            Some(path) => {
                let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
                ConnectionConfig::from_json(&raw)?
            }
            None => ConnectionConfig::default(),
        };
        let Some((host, port)) = addr.rsplit_once(':') else {
            bail!("address must be host:port, got {addr}");
        };
        connection.host = host.to_string();
        connection.port = port.parse().with_context(|| format!("invalid port in {addr}"))?;

        Ok(BenchConfig {
            connection,
            op_count,
            value_size,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG; keeps the workload reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_index(&mut self, len: usize) -> usize {
        (self.next_u64() % len as u64) as usize
    }
}

fn build_requests(value_size: usize) -> (Vec<Bytes>, Vec<Bytes>) {
    let value = "v".repeat(value_size);
    let mut sets = Vec::with_capacity(KEY_COUNT);
    let mut gets = Vec::with_capacity(KEY_COUNT);
    for idx in 0..KEY_COUNT {
        let key = format!("bench:{idx:04}");
        let mut set = Vec::new();
        resp::encode_command(&[b"SET", key.as_bytes(), value.as_bytes()], &mut set);
        let mut get = Vec::new();
        resp::encode_command(&[b"GET", key.as_bytes()], &mut get);
        sets.push(Bytes::from(set));
        gets.push(Bytes::from(get));
    }
    (sets, gets)
}

fn report(label: &str, elapsed: Duration, snapshot: &LatencySnapshot) {
    let secs = elapsed.as_secs_f64();
    let ops = snapshot.samples + snapshot.errors;
    let ops_per_sec = (ops as f64) / secs;
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, mean {:?}, errors {})",
        snapshot.mean(),
        snapshot.errors
    );
    for quantile in [0.5, 0.99] {
        match snapshot.quantile_bound(quantile) {
            Some(bound) => println!("  p{:.0} <= {bound:?}", quantile * 100.0),
            None => println!("  p{:.0} > {:?}", quantile * 100.0, last_bound(snapshot)),
        }
    }
}

fn last_bound(snapshot: &LatencySnapshot) -> Duration {
    Duration::from_micros(snapshot.bounds_us.last().copied().unwrap_or(0))
}

async fn run_phase(
    conn: &QueuedConnection,
    requests: &[Bytes],
    op_count: usize,
    seed: u64,
) -> (Duration, LatencySnapshot) {
    let histogram = LatencyHistogram::default();
    let mut rng = XorShift64::new(seed);
    let start = Instant::now();
    for _ in 0..op_count {
        let payload = requests[rng.next_index(requests.len())].clone();
        let sent = Instant::now();
        let outcome = conn
            .send(
                Request::new(payload)
                    .fulfill(resp::reply_rule())
                    .timeout(REQUEST_TIMEOUT),
            )
            .await;
        match outcome {
            Ok(_) => histogram.record(sent.elapsed()),
            Err(err) => {
                warn!(error = %err, "request failed");
                histogram.record_error();
            }
        }
    }
    (start.elapsed(), histogram.snapshot())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("nsock-bench failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = BenchConfig::from_args()?;
    let conn = QueuedConnection::builder(config.connection.clone())
        .on_state_change(|change| {
            info!(
                host = change.host,
                port = change.port,
                state = %change.state,
                "connection state"
            )
        })
        .spawn();

    println!(
        "target={}:{}, ops={}, value_size={}",
        config.connection.host, config.connection.port, config.op_count, config.value_size
    );
    let (sets, gets) = build_requests(config.value_size);

    let (elapsed, snapshot) = run_phase(&conn, &sets, config.op_count, 0x1234_5678_9ABC_DEF0).await;
    report("SET", elapsed, &snapshot);
    let (elapsed, snapshot) = run_phase(&conn, &gets, config.op_count, 0x0FED_CBA9_8765_4321).await;
    report("GET", elapsed, &snapshot);

    conn.disconnect();
    Ok(())
}
