use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use mentorcall_core::{
    logging, CallConfig, CallSession, CallView, Config, InMemoryRelay, LoopbackNetwork, Notice,
    SessionDeps, SessionHandle, SessionId, SessionParams, SyntheticDevices,
};

#[derive(Parser, Debug)]
#[command(name = "mentorcall")]
#[command(about = "Run a two-participant mentorship call in-process", long_about = None)]
struct Args {
    /// Session room key
    #[arg(long, env = "MENTORCALL_SESSION", default_value = "abc123")]
    session: String,

    /// Participant who joins first
    #[arg(long, default_value = "Asha")]
    first: String,

    /// Participant who joins second
    #[arg(long, default_value = "Rahul")]
    second: String,

    /// Configuration file
    #[arg(long, env = "MENTORCALL_CONFIG")]
    config: Option<String>,

    /// How long to stay connected before hanging up, in milliseconds
    #[arg(long, default_value = "500")]
    hold_ms: u64,

    /// Upper bound on every wait, in seconds
    #[arg(long, default_value = "10")]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    config.call.validate()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(session_id = %args.session, "MentorCall harness starting...");

    // 3. Wire the in-process collaborators
    let relay = InMemoryRelay::new(config.call.max_participants);
    let network = LoopbackNetwork::new();
    let deps = SessionDeps {
        devices: Arc::new(SyntheticDevices::new()),
        network: Arc::new(network.clone()),
        signaling: Arc::new(relay.clone()),
    };

    let wait = Duration::from_secs(args.wait_secs);
    if let Err(e) = run(&args, &config.call, deps, wait).await {
        error!("Call harness failed: {e:#}");
        return Err(e);
    }

    info!(
        members = relay.member_count(&SessionId::from(args.session.as_str())),
        endpoints = network.endpoint_count(),
        "MentorCall harness finished"
    );
    Ok(())
}

fn join(deps: &SessionDeps, config: &CallConfig, session: &str, name: &str) -> SessionHandle {
    let handle = CallSession::spawn(
        deps.clone(),
        SessionParams {
            session_id: SessionId::from(session),
            display_name: name.to_string(),
            config: config.clone(),
        },
    );

    let mut notices = handle.notices();
    let who = name.to_string();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                Notice::Info(text) => info!(participant = %who, "{text}"),
                Notice::Error(text) => error!(participant = %who, "{text}"),
            }
        }
    });

    handle
}

fn report(name: &str, view: &CallView) {
    info!(
        participant = name,
        status = %view.status,
        peer = %view.peer_name,
        mic = view.mic_enabled,
        cam = view.cam_enabled,
        "View updated"
    );
}

async fn run(args: &Args, config: &CallConfig, deps: SessionDeps, wait: Duration) -> Result<()> {
    let first = join(&deps, config, &args.session, &args.first);
    first.initialize().await?;
    report(&args.first, &first.current());

    let second = join(&deps, config, &args.session, &args.second);
    second.initialize().await?;

    let view = first.wait_for(wait, |v| v.peer_connected || v.is_ended()).await?;
    report(&args.first, &view);
    let view = second.wait_for(wait, |v| v.peer_connected || v.is_ended()).await?;
    report(&args.second, &view);
    anyhow::ensure!(
        first.current().peer_connected && second.current().peer_connected,
        "participants did not connect"
    );

    first.toggle_mic().await?;
    report(&args.first, &first.current());
    first.toggle_mic().await?;
    report(&args.first, &first.current());

    tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;

    second.end_call().await?;
    let view = first
        .wait_for(wait, |v| v.state.is_waiting() || v.is_ended())
        .await?;
    report(&args.first, &view);

    first.end_call().await?;
    report(&args.first, &first.current());
    Ok(())
}
