//! Drives synthetic signed traffic at a telemetry relay.
//!
//! Each request carries one `metric` event and three `proc` events for a
//! random agent. The body is serialized once and signed over those exact
//! bytes. Runs until Ctrl-C (or `--count` requests), then prints totals.

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use serde_json::{json, Value};

use lib_common::loggers::{setup_logging, LoggerLocalOptions};
use lib_common::retrieve::ApiClient;

#[derive(Parser, Debug)]
#[clap(about = "Telemetry load emitter", version)]
struct Args {
    /// Full ingest endpoint.
    #[clap(long, env = "API_URL", default_value = "http://localhost:8000/api/ingest")]
    url: String,

    #[clap(long, env = "API_TOKEN", hide_env_values = true, default_value = "telemetry-secret-token")]
    token: String,

    #[clap(long, env = "HMAC_SECRET", hide_env_values = true, default_value = "telemetry-hmac-secret")]
    secret: String,

    /// Requests per second.
    #[clap(long, default_value_t = 100)]
    rate: u32,

    /// Requests per loop.
    #[clap(long, default_value_t = 5)]
    batch: u32,

    #[clap(long, default_value = "loadgen")]
    agent_prefix: String,

    /// Stop after this many requests.
    #[clap(long)]
    count: Option<u64>,

    #[clap(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Default)]
struct Totals {
    sent: u64,
    accepted: u64,
    events: u64,
    rejected: u64,
    failed: u64,
}

fn agent_id(prefix: &str, rng: &mut impl Rng) -> String {
    format!("{}-{:04}", prefix, rng.random_range(1..=1000))
}

fn make_batch(agent_id: &str, rng: &mut impl Rng) -> Value {
    let mut events = vec![json!({
        "type": "metric",
        "cpu": rng.random::<f64>(),
        "mem_free": rng.random_range(256u64..=16_384) * 1024 * 1024,
    })];
    events.extend((0..3).map(|i| {
        json!({
            "type": "proc",
            "pid": rng.random_range(200..=50_000),
            "name": format!("proc-{i}"),
            "cpu": rng.random::<f64>(),
        })
    }));
    json!({
        "agent_id": agent_id,
        "ts": chrono::Utc::now().to_rfc3339(),
        "platform": "loadgen",
        "events": events,
    })
}

async fn send_one(client: &ApiClient, secret: &[u8], body: Vec<u8>, totals: &mut Totals) {
    totals.sent += 1;
    let timestamp = chrono::Utc::now().timestamp();
    match client.post_signed::<Value>("", secret, timestamp, body).await {
        Ok(response) if response.success => {
            totals.accepted += 1;
            totals.events += response
                .data
                .as_ref()
                .and_then(|v| v["stored"].as_u64())
                .unwrap_or(0);
        }
        Ok(response) => {
            totals.rejected += 1;
            tracing::warn!(
                status = response.status,
                body = response.error_body.as_deref().unwrap_or(""),
                "request rejected"
            );
        }
        Err(e) => {
            totals.failed += 1;
            tracing::warn!("request failed: {:#}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let _guard = setup_logging(
        "load-emitter",
        &LoggerLocalOptions {
            level: args.log_level.clone(),
            ..Default::default()
        },
    )?;

    // A retried signed request would come back as a replay.
    let client = ApiClient::with_max_retries(&args.url, Some(args.token.clone()), 0)
        .context("invalid --url")?;
    let secret = args.secret.as_bytes();
    let interval = Duration::from_secs_f64(1.0 / f64::from(args.rate.max(1)));

    let mut totals = Totals::default();
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    let limit = args.count.unwrap_or(u64::MAX);

    println!(
        "emitting to {} at {} req/s, {} per loop (Ctrl-C to stop)",
        args.url, args.rate, args.batch
    );

    let run = async {
        loop {
            let bodies = {
                let mut rng = rand::rng();
                (0..args.batch.max(1))
                    .map(|_| {
                        let agent = agent_id(&args.agent_prefix, &mut rng);
                        serde_json::to_vec(&make_batch(&agent, &mut rng))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            };
            for body in bodies {
                if totals.sent >= limit {
                    return anyhow::Ok(());
                }
                ticker.tick().await;
                send_one(&client, secret, body, &mut totals).await;
            }
        }
    };

    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => println!("\ninterrupted"),
    }

    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "sent {} requests in {:.1}s ({:.1} req/s): {} accepted ({} events), {} rejected, {} failed",
        totals.sent,
        elapsed,
        totals.sent as f64 / elapsed.max(f64::EPSILON),
        totals.accepted,
        totals.events,
        totals.rejected,
        totals.failed
    );
    Ok(())
}
