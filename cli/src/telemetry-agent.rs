//! Reports this machine's load to a telemetry relay.
//!
//! Every tick the agent first drains its offline queue, then samples CPU,
//! free memory and the busiest processes and posts them as one signed batch.
//! A batch that cannot be delivered is written to the queue directory and
//! retried on a later tick. Queued bodies are signed again with a fresh
//! timestamp when flushed, so old batches never trip the relay's drift or
//! replay checks.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use serde_json::{json, Value};
use sysinfo::System;

use lib_common::loggers::{setup_logging, LoggerLocalOptions};
use lib_common::retrieve::{ApiClient, ApiResponse};

const INGEST_PATH: &str = "api/ingest";

#[derive(Parser, Debug)]
#[clap(about = "Telemetry agent", version)]
struct Args {
    /// Base URL of the relay; batches go to `<base>/api/ingest`.
    #[clap(long, env = "API_URL", default_value = "http://localhost:8000")]
    api_url: String,

    #[clap(long, env = "API_TOKEN", hide_env_values = true, default_value = "telemetry-secret-token")]
    token: String,

    #[clap(long, env = "HMAC_SECRET", hide_env_values = true, default_value = "telemetry-hmac-secret")]
    secret: String,

    /// Defaults to the lowercased host name.
    #[clap(long, env = "AGENT_ID")]
    agent_id: Option<String>,

    /// Directory holding batches that could not be delivered.
    #[clap(long, env = "QUEUE_PATH", default_value = "./queue")]
    queue_path: PathBuf,

    /// Seconds between samples.
    #[clap(long, env = "INTERVAL_SECONDS", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    interval_seconds: u64,

    /// How many of the busiest processes to report.
    #[clap(long, default_value_t = 3)]
    top: usize,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[clap(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,
}

/// Undelivered batches, one JSON file each.
///
/// File names start with a UTC timestamp so the lexical order of
/// [`DiskQueue::pending`] is the order batches were queued in.
#[derive(Debug)]
struct DiskQueue {
    dir: PathBuf,
}

impl DiskQueue {
    async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create queue directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    async fn enqueue(&self, body: &[u8]) -> anyhow::Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%f");
        let suffix: u32 = rand::rng().random();
        let path = self.dir.join(format!("{stamp}_{suffix:08x}.json"));

        // Written under another extension first so `pending` never sees half a file.
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, body)
            .await
            .with_context(|| format!("cannot write {}", partial.display()))?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }

    async fn pending(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))
    }

    /// Deletes a queued batch. A file that is already gone is not an error.
    async fn remove(&self, path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
        }
    }
}

/// Samples host load through `sysinfo`.
struct Sampler {
    system: System,
    top: usize,
}

impl Sampler {
    fn new(top: usize) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; take the first one now.
        system.refresh_cpu();
        system.refresh_processes();
        Self { system, top }
    }

    fn sample(&mut self, agent_id: &str) -> Value {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_processes();

        let cores = self.system.cpus().len().max(1) as f64;
        let cpu = fraction(f64::from(self.system.global_cpu_info().cpu_usage()), 1.0);

        let mut busiest: Vec<_> = self
            .system
            .processes()
            .values()
            .map(|p| (p, fraction(f64::from(p.cpu_usage()), cores)))
            .filter(|(_, cpu)| *cpu > 0.0)
            .collect();
        busiest.sort_by(|a, b| b.1.total_cmp(&a.1));
        busiest.truncate(self.top);

        let mut events = vec![json!({
            "type": "metric",
            "cpu": cpu,
            "mem_free": self.system.available_memory(),
        })];
        events.extend(busiest.into_iter().map(|(process, cpu)| {
            json!({
                "type": "proc",
                "pid": process.pid().as_u32(),
                "name": process.name(),
                "cpu": cpu,
                "rss": process.memory(),
            })
        }));

        json!({
            "agent_id": agent_id,
            "ts": chrono::Utc::now().to_rfc3339(),
            "platform": std::env::consts::OS,
            "events": events,
        })
    }
}

/// Percent over `cores` cores as a 0..=1 fraction, rounded to four places.
fn fraction(percent: f64, cores: f64) -> f64 {
    let value = (percent / 100.0 / cores).clamp(0.0, 1.0);
    (value * 10_000.0).round() / 10_000.0
}

fn default_agent_id() -> String {
    System::host_name()
        .map(|name| name.to_lowercase())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Signs `body` with the current time and posts it.
async fn post_batch(client: &ApiClient, secret: &[u8], body: Vec<u8>) -> anyhow::Result<ApiResponse<Value>> {
    let timestamp = chrono::Utc::now().timestamp();
    client.post_signed::<Value>(INGEST_PATH, secret, timestamp, body).await
}

/// Sends queued batches oldest first and stops at the first one that does
/// not go through. Returns how many were delivered.
///
/// A batch the relay rejects as malformed can never succeed and is dropped.
async fn flush_offline(client: &ApiClient, secret: &[u8], queue: &DiskQueue) -> anyhow::Result<usize> {
    let mut flushed = 0;
    for path in queue.pending().await? {
        let body = queue.read(&path).await?;
        let response = post_batch(client, secret, body).await?;
        if response.success {
            queue.remove(&path).await?;
            flushed += 1;
            tracing::info!(file = %path.display(), "flushed queued batch");
        } else if response.status == 422 {
            tracing::warn!(
                file = %path.display(),
                body = response.error_body.as_deref().unwrap_or(""),
                "dropping queued batch the relay refuses"
            );
            queue.remove(&path).await?;
        } else {
            anyhow::bail!("relay answered {} while flushing", response.status);
        }
    }
    Ok(flushed)
}

/// Posts one fresh batch, queueing it when delivery fails.
async fn send_or_queue(client: &ApiClient, secret: &[u8], queue: &DiskQueue, body: Vec<u8>) -> anyhow::Result<()> {
    let failure = match post_batch(client, secret, body.clone()).await {
        Ok(response) if response.success => {
            tracing::debug!(stored = ?response.data.as_ref().map(|v| &v["stored"]), "batch delivered");
            return Ok(());
        }
        Ok(response) if response.status == 422 => {
            tracing::warn!(
                body = response.error_body.as_deref().unwrap_or(""),
                "relay refused the batch, not queueing it"
            );
            return Ok(());
        }
        Ok(response) => format!("relay answered {}", response.status),
        Err(e) => format!("{e:#}"),
    };
    let path = queue.enqueue(&body).await?;
    tracing::warn!(file = %path.display(), "send failed, queued batch: {}", failure);
    Ok(())
}

/// Flush, sample, send; once per `interval` until an unrecoverable error.
async fn run(
    client: &ApiClient,
    secret: &[u8],
    queue: &DiskQueue,
    sampler: &mut Sampler,
    agent_id: &str,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        if let Err(e) = flush_offline(client, secret, queue).await {
            tracing::warn!("flush failed: {:#}", e);
        }

        let body = serde_json::to_vec(&sampler.sample(agent_id))?;
        send_or_queue(client, secret, queue, body).await?;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let _guard = setup_logging(
        "telemetry-agent",
        &LoggerLocalOptions {
            level: args.log_level.clone(),
            log_dir: args.log_dir.clone(),
            ..Default::default()
        },
    )?;

    let base_url = format!("{}/", args.api_url.trim_end_matches('/'));
    // A retried signed request would come back as a replay; the queue retries instead.
    let client = ApiClient::with_max_retries(&base_url, Some(args.token.clone()), 0)
        .context("invalid API_URL")?;
    let secret = args.secret.as_bytes();
    let agent_id = args.agent_id.clone().unwrap_or_else(default_agent_id);
    let queue = DiskQueue::open(&args.queue_path).await?;
    let mut sampler = Sampler::new(args.top);
    let interval = Duration::from_secs(args.interval_seconds);

    tracing::info!(agent = %agent_id, url = %base_url, interval = args.interval_seconds, "agent started");

    tokio::select! {
        result = run(&client, secret, &queue, &mut sampler, &agent_id, interval) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("agent stopped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::models::IngestBatch;

    #[tokio::test]
    async fn test_queue_keeps_order_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(dir.path().join("queue")).await.unwrap();
        assert!(queue.pending().await.unwrap().is_empty());

        let first = queue.enqueue(br#"{"n":1}"#).await.unwrap();
        let second = queue.enqueue(br#"{"n":2}"#).await.unwrap();

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending, vec![first.clone(), second.clone()]);
        assert_eq!(queue.read(&first).await.unwrap(), br#"{"n":1}"#);

        queue.remove(&first).await.unwrap();
        queue.remove(&first).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), vec![second.clone()]);

        queue.remove(&second).await.unwrap();
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_ignores_foreign_and_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("20240101000000000000000_00000000.part"), b"{").unwrap();

        let queued = queue.enqueue(b"{}").await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), vec![queued]);
    }

    #[tokio::test]
    async fn test_unreachable_relay_leaves_queue_intact() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(dir.path()).await.unwrap();
        // Nothing listens on port 9 of the loopback interface.
        let client = ApiClient::with_max_retries("http://127.0.0.1:9/", None, 0).unwrap();

        send_or_queue(&client, b"secret", &queue, br#"{"n":1}"#.to_vec())
            .await
            .unwrap();
        let queued = queue.pending().await.unwrap();
        assert_eq!(queued.len(), 1);

        assert!(flush_offline(&client, b"secret", &queue).await.is_err());
        assert_eq!(queue.pending().await.unwrap(), queued);
        assert_eq!(queue.read(&queued[0]).await.unwrap(), br#"{"n":1}"#);
    }

    #[test]
    fn test_sample_is_a_valid_ingest_body() {
        let mut sampler = Sampler::new(3);
        let body = serde_json::to_vec(&sampler.sample("host-1")).unwrap();
        let batch = IngestBatch::from_slice(&body).unwrap();

        assert_eq!(batch.agent_id, "host-1");
        assert_eq!(batch.events[0].event_type, "metric");
        assert!(batch.events.len() <= 4);
        assert!(batch.events[1..].iter().all(|e| e.event_type == "proc"));
        let cpu = batch.events[0].cpu.unwrap();
        assert!((0.0..=1.0).contains(&cpu));
    }

    #[test]
    fn test_fraction_rounds_and_clamps() {
        assert_eq!(fraction(12.345_67, 1.0), 0.1235);
        assert_eq!(fraction(4.0, 4.0), 0.01);
        assert_eq!(fraction(400.0, 4.0), 1.0);
        assert_eq!(fraction(250.0, 1.0), 1.0);
        assert_eq!(fraction(-3.0, 1.0), 0.0);
    }
}
