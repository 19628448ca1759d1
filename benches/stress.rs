use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use ulid::Ulid;

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(host: &str, port: u16, tenant: &str, password: &str) -> Client {
        let stream = TcpStream::connect((host, port)).await.expect("connect failed");
        let (reader, writer) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(reader),
            writer,
        };
        let resp = client
            .send(json!({"tenant": tenant, "password": password}))
            .await;
        assert_eq!(resp["status"], "ok", "auth failed: {resp}");
        client
    }

    async fn send(&mut self, request: Value) -> Value {
        self.writer
            .write_all(format!("{request}\n").as_bytes())
            .await
            .expect("write failed");
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read failed");
        serde_json::from_str(&line).expect("bad frame")
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// Day `offset` of the bench window as an ISO date.
fn day(offset: i64) -> String {
    let base: chrono::NaiveDate = "2031-01-01".parse().unwrap();
    (base + chrono::Duration::days(offset)).to_string()
}

async fn register_unit(client: &mut Client, rate: i64) -> String {
    let resp = client
        .send(json!({"op": "register_unit", "daily_rate": rate}))
        .await;
    assert_eq!(resp["status"], "ok", "register failed: {resp}");
    resp["data"]["id"].as_str().unwrap().to_string()
}

/// Scenario 1: N workers booking DISTINCT units — the no-contention path.
/// Every create must succeed.
async fn bench_parallel_units(host: &str, port: u16, tenant: &str, password: &str, workers: usize, per_worker: usize) {
    let mut setup = Client::connect(host, port, tenant, password).await;
    let mut units = Vec::with_capacity(workers);
    for _ in 0..workers {
        units.push(register_unit(&mut setup, 5_000).await);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for unit in units {
        let (host, tenant, password) = (host.to_string(), tenant.to_string(), password.to_string());
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &tenant, &password).await;
            let mut latencies = Vec::with_capacity(per_worker);
            for i in 0..per_worker {
                // Non-overlapping 2-night stays marching forward.
                let t = Instant::now();
                let resp = client
                    .send(json!({
                        "op": "create_reservation",
                        "resource_id": unit,
                        "holder_id": Ulid::new().to_string(),
                        "start_date": day(2 * i as i64),
                        "end_date": day(2 * i as i64 + 2),
                        "no_expiry": true,
                    }))
                    .await;
                latencies.push(t.elapsed());
                assert_eq!(resp["status"], "ok", "create failed: {resp}");
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let elapsed = start.elapsed();
    println!(
        "parallel units: {} creates across {workers} units in {:.2}s ({:.0} ops/s)",
        all.len(),
        elapsed.as_secs_f64(),
        all.len() as f64 / elapsed.as_secs_f64()
    );
    print_latency("create (distinct units)", &mut all);
}

/// Scenario 2: N workers fighting over ONE unit and ONE date range — the
/// serialized path. Exactly one create per round may succeed.
async fn bench_contended_unit(host: &str, port: u16, tenant: &str, password: &str, workers: usize, rounds: usize) {
    let mut setup = Client::connect(host, port, tenant, password).await;
    let unit = register_unit(&mut setup, 5_000).await;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..workers {
        let (host, tenant, password, unit) = (
            host.to_string(),
            tenant.to_string(),
            password.to_string(),
            unit.clone(),
        );
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &tenant, &password).await;
            let mut latencies = Vec::with_capacity(rounds);
            let mut won = 0usize;
            for round in 0..rounds {
                let t = Instant::now();
                let resp = client
                    .send(json!({
                        "op": "create_reservation",
                        "resource_id": unit,
                        "holder_id": Ulid::new().to_string(),
                        "start_date": day(3 * round as i64),
                        "end_date": day(3 * round as i64 + 3),
                        "no_expiry": true,
                    }))
                    .await;
                latencies.push(t.elapsed());
                match resp["status"].as_str() {
                    Some("ok") => won += 1,
                    Some("error") if resp["code"] == "not_available" => {}
                    _ => panic!("unexpected response: {resp}"),
                }
            }
            (latencies, won)
        }));
    }

    let mut all = Vec::new();
    let mut total_won = 0;
    for handle in handles {
        let (latencies, won) = handle.await.unwrap();
        all.extend(latencies);
        total_won += won;
    }
    let elapsed = start.elapsed();
    println!(
        "contended unit: {} attempts, {total_won} wins ({rounds} rounds) in {:.2}s",
        all.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(total_won, rounds, "exactly one winner per round");
    print_latency("create (contended unit)", &mut all);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("STAYD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("STAYD_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7411);
    let password = std::env::var("STAYD_PASSWORD").unwrap_or_else(|_| "stayd".into());
    let tenant = format!("bench_{}", Ulid::new());

    println!("stayd stress bench against {host}:{port} (tenant {tenant})");

    bench_parallel_units(&host, port, &tenant, &password, 16, 50).await;
    bench_contended_unit(&host, port, &tenant, &password, 16, 25).await;
}
