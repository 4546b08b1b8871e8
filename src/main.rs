#![forbid(unsafe_code)]

//! chatload - virtual-user load generator for the chat service API
//!
//! Usage:
//!   chatload --scenario rest --users 200 --rooms 10
//!   chatload --scenario ws --users 100 --stages 10s:20,30s:100,10s:0
//!   BASE_URL=http://staging:8080 chatload --scenario rest
//!
//! The run provisions users and rooms once, ramps virtual users through the
//! configured stages, and exits non-zero if any threshold is violated.

use anyhow::Result;
use chatload::api::ApiClient;
use chatload::config::{self, RunConfig, ScenarioKind};
use chatload::fixtures;
use chatload::metrics::{Registry, Threshold};
use chatload::scenario::{RestScenario, WsScenario};
use chatload::scheduler::run_profile;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();

    // The scenario decides every other default, so resolve it first.
    let mut scenario = ScenarioKind::Ws;
    for window in args.windows(2) {
        if window[0] == "--scenario" {
            scenario = ScenarioKind::from_str(&window[1])?;
        }
    }

    let mut config = RunConfig::defaults_for(scenario);
    let mut custom_thresholds: Vec<Threshold> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--scenario" => i += 2,
            "--base-url" => {
                if i + 1 < args.len() {
                    config.base_url = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--ws-url" => {
                if i + 1 < args.len() {
                    config.ws_url = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--users" | "-u" => {
                if i + 1 < args.len() {
                    config.users = config::parse_count(&args[i + 1])?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--rooms" => {
                if i + 1 < args.len() {
                    config.group_rooms = config::parse_count(&args[i + 1])?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--stages" => {
                if i + 1 < args.len() {
                    config.profile.stages = config::parse_stages(&args[i + 1])?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--messages" => {
                if i + 1 < args.len() {
                    config.messages_per_connection = config::parse_count(&args[i + 1])? as u32;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--pacing" => {
                if i + 1 < args.len() {
                    config.message_pacing = config::parse_duration(&args[i + 1])?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--drain" => {
                if i + 1 < args.len() {
                    config.drain_wait = config::parse_duration(&args[i + 1])?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.connect_timeout = config::parse_duration(&args[i + 1])?;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--threshold" => {
                if i + 1 < args.len() {
                    custom_thresholds.push(Threshold::parse(&args[i + 1])?);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }
    if !custom_thresholds.is_empty() {
        config.thresholds = custom_thresholds;
    }

    run_load_test(config).await
}

async fn run_load_test(config: RunConfig) -> Result<()> {
    println!("\n=== Starting Load Test ===");
    println!("Scenario: {}", config.scenario.as_str());
    println!("Base URL: {}", config.base_url);
    if config.scenario == ScenarioKind::Ws {
        println!("WS URL: {}", config.ws_url);
        println!(
            "Messages/conn: {} ({}ms pacing, {}s drain, {}s timeout)",
            config.messages_per_connection,
            config.message_pacing.as_millis(),
            config.drain_wait.as_secs(),
            config.connect_timeout.as_secs()
        );
    }
    println!("Users: {}", config.users);
    match config.topology() {
        fixtures::RoomTopology::Group { rooms } => println!("Rooms: {rooms} group rooms"),
        fixtures::RoomTopology::Direct => println!("Rooms: pairwise direct rooms"),
    }
    let stages: Vec<String> = config
        .profile
        .stages
        .iter()
        .map(|s| format!("{}s:{}", s.duration.as_secs(), s.target))
        .collect();
    println!("Stages: {}", stages.join(", "));
    let thresholds: Vec<String> = config.thresholds.iter().map(|t| t.expression()).collect();
    println!("Thresholds: {}", thresholds.join(", "));
    println!("========================\n");

    let metrics = Arc::new(Registry::new());
    let client = ApiClient::new(config.base_url.clone(), metrics.clone());

    // Setup phase runs once; the fixture set is frozen before any virtual
    // user starts.
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    info!("provisioning {} users...", config.users);
    let fixture_set = Arc::new(
        fixtures::provision(&client, config.users, config.topology(), nonce).await,
    );
    info!(
        "provisioning complete: {} users, {} rooms",
        fixture_set.users.len(),
        fixture_set.rooms.len()
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, stopping after current iterations");
            let _ = stop_tx.send(true);
        }
    });

    match config.scenario {
        ScenarioKind::Rest => {
            let scenario = Arc::new(RestScenario::new(client, config.history_page_size));
            run_profile(
                &config.profile,
                move |ctx| {
                    let scenario = scenario.clone();
                    async move { scenario.iteration(&ctx).await }
                },
                fixture_set,
                metrics.clone(),
                stop_rx,
            )
            .await;
        }
        ScenarioKind::Ws => {
            let scenario = Arc::new(WsScenario::new(config.ws_url.clone(), config.ws_options()));
            run_profile(
                &config.profile,
                move |ctx| {
                    let scenario = scenario.clone();
                    async move { scenario.iteration(&ctx).await }
                },
                fixture_set,
                metrics.clone(),
                stop_rx,
            )
            .await;
        }
    }

    let report = metrics.snapshot();
    let verdicts = report.evaluate(&config.thresholds);
    report.print_summary(&verdicts);

    if verdicts.iter().any(|v| !v.passed) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_usage() {
    println!("chatload - load generator for the chat service API");
    println!("\nUsage:");
    println!("  chatload [OPTIONS]");
    println!("\nOptions:");
    println!("  --scenario <rest|ws>    Scenario to run (default: ws)");
    println!("  --base-url <URL>        REST base URL (default: $BASE_URL or http://localhost:8080)");
    println!("  --ws-url <URL>          WebSocket URL (default: $WS_URL or ws://localhost:8080/ws)");
    println!("  -u, --users <N>         Users to provision (default: 200 rest, 100 ws)");
    println!("  --rooms <N>             Group rooms for the rest scenario (default: 10)");
    println!("  --stages <LIST>         Ramp stages, e.g. 10s:50,30s:200,10s:0");
    println!("  --messages <N>          Messages per ws connection (default: 5)");
    println!("  --pacing <DUR>          Delay between ws messages (default: 500ms)");
    println!("  --drain <DUR>           Receive window before closing (default: 2s)");
    println!("  --timeout <DUR>         Per-connection deadline (default: 15s)");
    println!("  --threshold <EXPR>      Replace default thresholds; repeatable.");
    println!("                          e.g. http_req_duration:p95<500, http_req_failed:rate<0.01");
    println!("  -h, --help              Print this help message");
    println!("\nEnvironment Variables:");
    println!("  BASE_URL, WS_URL        Endpoint defaults");
    println!("  RUST_LOG=debug          Enable debug logging");
}
