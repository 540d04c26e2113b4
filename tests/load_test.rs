//! Load testing for mixed HTTP/1 and gRPC traffic on one port.

use std::time::{Duration, Instant};

mod common;

use common::{grpc_unary, start_server, wait_until, ECHO_METHOD};

#[tokio::test]
async fn test_mixed_load() {
    let server = start_server(|_| {}).await;
    let addr = server.addr;

    let concurrency = 10; // per protocol
    let requests_per_task = 20;
    let total_requests = 2 * concurrency * requests_per_task;

    let client = reqwest::Client::new();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for worker in 0..concurrency {
        let client = client.clone();
        let url = format!("http://{addr}/api/v1/echo");
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for i in 0..requests_per_task {
                let body = format!("http-{worker}-{i}");
                let req_start = Instant::now();
                if let Ok(res) = client.post(&url).body(body.clone()).send().await {
                    if res.status().is_success() && res.text().await.ok() == Some(body) {
                        latencies.push(req_start.elapsed());
                    }
                }
            }
            latencies
        }));

        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for i in 0..requests_per_task {
                let text = format!("rpc-{worker}-{i}");
                let req_start = Instant::now();
                if let Ok(reply) = grpc_unary(addr, ECHO_METHOD, &text).await {
                    if reply.text == format!("echo: {text}") {
                        latencies.push(req_start.elapsed());
                    }
                }
            }
            latencies
        }));
    }

    let mut all_latencies: Vec<Duration> = Vec::new();
    for task in tasks {
        all_latencies.extend(task.await.unwrap());
    }

    let duration = start.elapsed();
    let rps = total_requests as f64 / duration.as_secs_f64();

    assert_eq!(
        all_latencies.len(),
        total_requests,
        "some requests failed or were misrouted"
    );

    all_latencies.sort();
    let p50 = all_latencies[all_latencies.len() / 2];
    let p95 = all_latencies[(all_latencies.len() as f64 * 0.95) as usize];
    let p99 = all_latencies[(all_latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests: {}", total_requests);
    println!("Concurrency:    {}", 2 * concurrency);
    println!("Total Duration: {:?}", duration);
    println!("Requests/sec:   {:.2}", rps);
    println!("P50 Latency:    {:?}", p50);
    println!("P95 Latency:    {:?}", p95);
    println!("P99 Latency:    {:?}", p99);
    println!("-------------------------\n");

    // Every gRPC call used its own connection.
    let stats = server.supervisor.stats();
    let expected_rpc = (concurrency * requests_per_task) as u64;
    wait_until(|| stats.snapshot().dispatched_rpc == expected_rpc).await;
    assert_eq!(stats.snapshot().unmatched(), 0);

    server.stop().await.unwrap();
}
