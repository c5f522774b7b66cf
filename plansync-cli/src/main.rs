//! plansync: terminal client for a shared task and calendar service.
//!
//! Keeps a local view of the user's tasks and calendar events, reconciled
//! live against change events from other clients over MQTT. Commands:
//!
//!   add <title>          — Create a task
//!   done <id>            — Toggle a task's completed flag
//!   rm <id>              — Delete a task
//!   list                 — Show the local task collection
//!   events               — Show the local calendar collection
//!   stats                — Fetch task statistics from the service
//!   status               — Show link state and transport mode
//!   quit                 — Disconnect and exit

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use plansync_sdk::model::{Stats, TaskDraft, TaskPatch};
use plansync_sdk::{
    ApiClient, ChangeEvent, ConnectionManager, LinkState, Payload, Publisher, Reconciler,
    SyncError, TopicRouter, TransportMode, router,
};
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;

#[derive(Parser)]
#[command(name = "plansync", about = "Synchronized task and calendar client")]
struct Args {
    /// Broker URL (mqtt:// or mqtts://)
    #[arg(long)]
    broker_url: Option<String>,

    /// Record service base URL (default http://localhost:5000/api)
    #[arg(long)]
    api_url: Option<String>,

    /// Service account username
    #[arg(long, env = "PLANSYNC_USERNAME")]
    username: String,

    /// Service account password
    #[arg(long, env = "PLANSYNC_PASSWORD")]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plansync=info".into()),
        )
        .init();

    let args = Args::parse();
    let file = config::Config::load();

    let mut sync_config = file.sync_config();
    if let Some(url) = args.broker_url {
        sync_config.broker_url = url;
    }
    let api_url = args
        .api_url
        .or_else(|| file.api_url.clone())
        .unwrap_or_else(|| "http://localhost:5000/api".to_string());

    let api = ApiClient::new(&api_url)?;
    let user = api
        .login(&args.username, &args.password)
        .await
        .context("login failed")?;
    tracing::info!(username = %user.username, "logged in");

    let topics = sync_config.topics.clone();
    let (mut manager, deliveries) = ConnectionManager::new(sync_config);
    manager.connect();
    let handle = manager.handle()?;
    tracing::info!(client_id = %handle.client_id(), "connecting");

    let router = Arc::new(TopicRouter::new());
    let mut changes = router.change_stream(&[
        topics.tasks.as_str(),
        topics.calendar.as_str(),
        topics.sync.as_str(),
    ]);
    router.on(&topics.notification, |_, payload| {
        match payload {
            Payload::Json(value) => println!("notification: {value}"),
            Payload::Raw(text) => println!("notification: {text}"),
            Payload::Bytes(bytes) => {
                tracing::debug!(len = bytes.len(), "ignoring binary notification");
            }
        }
        Ok(())
    });
    router.subscribe_all(&handle).await?;
    tokio::spawn(router::pump(Arc::clone(&router), deliveries));

    let publisher = Publisher::new(handle.clone());
    let mut engine = Reconciler::new(api.clone(), handle.client_id().to_string());
    engine.load().await.context("initial load failed")?;
    println!(
        "{} tasks, {} calendar events loaded",
        engine.tasks().len(),
        engine.events().len()
    );

    let mut states = handle.watch_state();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    print!("> ");
    flush_prompt();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(line.trim(), &api, &mut engine, &publisher, &topics.tasks, &handle).await {
                    Ok(Loop::Continue) => {}
                    Ok(Loop::Quit) => break,
                    Err(error) => eprintln!("error: {error}"),
                }
                print!("> ");
                flush_prompt();
            }
            Some(event) = changes.recv() => {
                apply_remote(&mut engine, &event).await;
            }
            result = states.changed() => {
                if result.is_err() {
                    break;
                }
                let state = *states.borrow();
                tracing::info!(?state, "link state changed");
                if state == LinkState::Faulted {
                    eprintln!("broker unreachable; continuing detached");
                }
            }
        }
    }

    manager.disconnect().await;
    api.logout().await.ok();
    Ok(())
}

enum Loop {
    Continue,
    Quit,
}

async fn run_command(
    line: &str,
    api: &ApiClient,
    engine: &mut Reconciler<ApiClient>,
    publisher: &Publisher,
    tasks_topic: &str,
    handle: &plansync_sdk::ConnectionHandle,
) -> Result<Loop> {
    let (command, rest) = match line.split_once(' ') {
        Some((head, tail)) => (head, tail.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "add" => {
            if rest.is_empty() {
                anyhow::bail!("usage: add <title>");
            }
            let (task, change) = engine
                .create_task(TaskDraft {
                    title: rest.to_string(),
                    ..Default::default()
                })
                .await?;
            println!("created #{}: {}", task.id, task.title);
            announce(publisher, tasks_topic, &change).await;
        }
        "done" => {
            let id = parse_id(rest)?;
            let completed = engine
                .task(id)
                .map(|t| !t.completed)
                .context("no such task locally")?;
            let (task, change) = engine
                .update_task(id, TaskPatch {
                    completed: Some(completed),
                    ..Default::default()
                })
                .await?;
            println!(
                "#{} {}",
                task.id,
                if task.completed { "done" } else { "reopened" }
            );
            announce(publisher, tasks_topic, &change).await;
        }
        "rm" => {
            let id = parse_id(rest)?;
            let change = engine.delete_task(id).await?;
            println!("deleted #{id}");
            announce(publisher, tasks_topic, &change).await;
        }
        "list" => {
            for task in engine.tasks() {
                println!(
                    "[{}] #{} {} ({:?})",
                    if task.completed { "x" } else { " " },
                    task.id,
                    task.title,
                    task.priority,
                );
            }
        }
        "events" => {
            for event in engine.events() {
                println!("#{} {} @ {}", event.id, event.title, event.start_time);
            }
        }
        "stats" => {
            let Stats {
                total_tasks,
                completed_tasks,
                pending_tasks,
                due_today,
            } = api.stats().await?;
            println!(
                "{total_tasks} total, {completed_tasks} done, {pending_tasks} pending, {due_today} due today"
            );
        }
        "status" => {
            let detached = handle.mode() == TransportMode::Fallback;
            println!(
                "{:?}{}",
                handle.state(),
                if detached { " (detached)" } else { "" }
            );
        }
        "quit" | "exit" => return Ok(Loop::Quit),
        other => eprintln!("unknown command: {other}"),
    }
    Ok(Loop::Continue)
}

/// Best-effort broadcast of a local change. While disconnected the publish
/// fails loud; the local mutation already succeeded, so just report it.
async fn announce(publisher: &Publisher, topic: &str, change: &ChangeEvent) {
    match publisher.publish_change(topic, change).await {
        Ok(()) => {}
        Err(SyncError::NotConnected { .. }) => {
            eprintln!("(offline: change saved but not broadcast)");
        }
        Err(error) => eprintln!("broadcast failed: {error}"),
    }
}

async fn apply_remote(engine: &mut Reconciler<ApiClient>, event: &ChangeEvent) {
    match engine.apply_remote(event).await {
        Ok(applied) => {
            tracing::debug!(?applied, origin = %event.origin, "remote change applied");
        }
        Err(error) => tracing::warn!(%error, "remote change could not be applied"),
    }
}

fn parse_id(rest: &str) -> Result<i64> {
    rest.parse().context("expected a numeric id")
}

fn flush_prompt() {
    use std::io::Write;
    let _ = std::io::stdout().flush();
}
