use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use lib_common::models::{BroadcastPayload, ControlMessage};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Watches a telemetry relay's live feed", long_about = None)]
struct Args {
    /// Relay WebSocket endpoint
    #[clap(long, env = "WS_URL", default_value = "ws://localhost:8000/ws")]
    url: String,

    /// Only receive events for this agent
    #[clap(long)]
    agent_id: Option<String>,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 10)]
    report_interval_seconds: u64,
}

#[derive(Default)]
struct Stats {
    window: VecDeque<DateTime<Utc>>,
    per_agent: BTreeMap<String, u64>,
    total: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let url = match &args.agent_id {
        Some(agent) => format!("{}?agent_id={}", args.url, agent),
        None => args.url.clone(),
    };

    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval = args.report_interval_seconds.max(1);
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval)).await;
            let one_minute_ago = Utc::now() - Duration::minutes(1);

            let mut data = stats_reporter.lock().unwrap_or_else(|p| p.into_inner());
            while data.window.front().is_some_and(|&t| t < one_minute_ago) {
                data.window.pop_front();
            }

            println!(
                "[{}] {} events total, {} in the last minute, {} agents",
                Utc::now().format("%H:%M:%S"),
                data.total,
                data.window.len(),
                data.per_agent.len()
            );
            let mut busiest: Vec<_> = data.per_agent.iter().collect();
            busiest.sort_by(|a, b| b.1.cmp(a.1));
            for (agent, count) in busiest.into_iter().take(5) {
                println!("    {agent:<20} {count}");
            }
        }
    });

    println!("Connecting to {url}");
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    println!("Connected");
    let (_write, mut read) = ws_stream.split();

    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str::<BroadcastPayload>(text.as_str()) {
                Ok(BroadcastPayload::Event(record)) => {
                    let mut data = stats.lock().unwrap_or_else(|p| p.into_inner());
                    data.total += 1;
                    data.window.push_back(Utc::now());
                    *data.per_agent.entry(record.agent_id).or_default() += 1;
                }
                Ok(BroadcastPayload::Control(ControlMessage::Clear { agent_id })) => {
                    let mut data = stats.lock().unwrap_or_else(|p| p.into_inner());
                    match &agent_id {
                        Some(agent) => {
                            data.per_agent.remove(agent);
                        }
                        None => data.per_agent.clear(),
                    }
                    println!("cleared: {}", agent_id.as_deref().unwrap_or("all agents"));
                }
                Err(e) => eprintln!("unrecognised frame: {e}"),
            },
            Message::Close(frame) => {
                println!("server closed the connection: {frame:?}");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
