//! queuehub CLI: walkthroughs and load runs against an in-process engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use queuehub::config::Config;
use queuehub::telemetry::work::{record_state_transition, start_work_span};
use queuehub::telemetry::{TelemetryConfig, init_telemetry};
use queuehub::{CancellationToken, Engine, QueueInfo, State, Work};

#[derive(Parser)]
#[command(name = "queuehub", about = "In-process work queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Produce a few items into two queues and consume them with a fan-in wait
    Demo {
        /// Give up waiting for work after this many seconds
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
        /// Print queue summaries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push many items across several queues and drain them concurrently
    Stress {
        /// Total work items to admit
        #[arg(long, default_value_t = 1_000)]
        items: usize,
        /// Number of queues to spread them over
        #[arg(long, default_value_t = 4)]
        queues: usize,
        /// Concurrent fan-in consumers
        #[arg(long, default_value_t = 4)]
        consumers: usize,
        /// Stop consumers after this many seconds regardless of progress
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "queuehub".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let engine = Arc::new(Engine::with_config(config.engine)?);

    let result = match cli.command {
        Command::Demo { timeout_secs, json } => cmd_demo(&engine, timeout_secs, json).await,
        Command::Stress {
            items,
            queues,
            consumers,
            timeout_secs,
        } => cmd_stress(Arc::clone(&engine), items, queues, consumers, timeout_secs).await,
    };

    engine.shutdown();
    result
}

/// Cancel `token` once `after` has elapsed.
fn cancel_after(token: &CancellationToken, after: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(after) => token.cancel(),
        }
    });
}

async fn cmd_demo(engine: &Engine, timeout_secs: u64, json: bool) -> anyhow::Result<()> {
    let emails = engine.get_or_create_queue("emails");
    let sms = engine.get_or_create_queue("sms");

    emails.add_work(Work::new("emails", "send welcome email"))?;
    emails.add_work(Work::new("emails", "send monthly invoice"))?;
    sms.add_work(Work::new("sms", "send verification code"))?;

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(timeout_secs));

    loop {
        let (work, key) = match engine
            .next_work_from_queues(&cancel, &["emails", "sms"])
            .await
        {
            Ok(found) => found,
            Err(e) => {
                println!("No work available: {e}");
                break;
            }
        };

        let span = start_work_span(&key, &work.id());
        println!("Processing from {key}: {}", work.inbound_payload());
        work.start();
        record_state_transition(&span, "pending", "running");

        tokio::time::sleep(Duration::from_millis(250)).await;
        work.set_outbound_payload("sent");
        work.finish();
        record_state_transition(&span, "running", "done");
        println!("Finished: {} (state: {})", work.id(), work.state());

        if emails.count_pending_works() + sms.count_pending_works() == 0 {
            println!("All work processed");
            break;
        }
    }
    cancel.cancel();

    print_summaries(&[emails.info(), sms.info()], json)
}

async fn cmd_stress(
    engine: Arc<Engine>,
    items: usize,
    queues: usize,
    consumers: usize,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(queues > 0, "--queues must be at least 1");
    anyhow::ensure!(consumers > 0, "--consumers must be at least 1");

    let keys: Vec<String> = (0..queues).map(|i| format!("stress-{i}")).collect();
    let started = Instant::now();

    for i in 0..items {
        let key = &keys[i % keys.len()];
        engine
            .get_or_create_queue(key)
            .add_work(Work::new(key.as_str(), format!("item-{i}")))?;
    }
    let admitted_in = started.elapsed();

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(timeout_secs));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut consumers_set = tokio::task::JoinSet::new();
    for _ in 0..consumers {
        let engine = Arc::clone(&engine);
        let keys = keys.clone();
        let cancel = cancel.clone();
        let processed = Arc::clone(&processed);
        consumers_set.spawn(async move {
            while let Ok((work, _)) = engine.next_work_from_queues(&cancel, keys.as_slice()).await {
                if let Err(e) = work.state().check_transition(State::Running) {
                    tracing::warn!(work.id = %work.id(), "unexpected state on delivery: {e}");
                }
                work.start();
                work.finish();
                if processed.fetch_add(1, Ordering::Relaxed) + 1 >= items {
                    cancel.cancel();
                }
            }
        });
    }
    if items == 0 {
        cancel.cancel();
    }
    while let Some(joined) = consumers_set.join_next().await {
        joined?;
    }

    let infos: Vec<QueueInfo> = keys
        .iter()
        .filter_map(|key| engine.get_queue(key))
        .map(|queue| queue.info())
        .collect();
    println!(
        "admitted {items} in {admitted_in:?}, processed {} in {:?}",
        processed.load(Ordering::Relaxed),
        started.elapsed()
    );
    print_summaries(&infos, false)
}

fn print_summaries(infos: &[QueueInfo], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(infos)?);
        return Ok(());
    }

    println!(
        "{:<12}  {:>6}  {:>7}  {:>7}  {:>6}  {:>6}  {:>7}",
        "QUEUE", "TOTAL", "PENDING", "RUNNING", "DONE", "FAILED", "BACKLOG"
    );
    println!("{}", "-".repeat(66));
    for info in infos {
        println!(
            "{:<12}  {:>6}  {:>7}  {:>7}  {:>6}  {:>6}  {:>7}",
            info.key, info.total, info.pending, info.running, info.done, info.failed, info.backlog
        );
    }
    Ok(())
}
