// SPDX-License-Identifier: Apache-2.0

//! `veldd`: the runnable master binary (SPEC_FULL.md §6.4).
//!
//! Wires a `veld_transport::Router`, a `MasterRegistry`, and a line-JSON TCP
//! control listener together. The workflow engine is an external
//! collaborator (spec.md §6.1, Non-goals): this binary links in
//! `DemoWorkflow`, a placeholder that never produces real jobs, purely so
//! `veldd` is a runnable end-to-end smoke-test target. An embedding
//! application supplies its own `Workflow` and drives `veld-daemon` as a
//! library instead of running this binary.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use veld_core::{
    FsmEvent, JobOutcome, LaunchError, Launcher, NodeId, NodeState, SlaveDescription, Workflow,
};
use veld_daemon::control::{self, HandshakeReply};
use veld_daemon::registry::RegistryConfig;
use veld_daemon::{dispatch, Daemon, DaemonError, MasterRegistry, SharedDaemon, Session};
use veld_transport::Router;
use veld_wire::{framing, ControlRequest, ErrorReply, ReconnectOk};

#[derive(Parser, Debug)]
#[command(name = "veldd", about = "Master coordinator for a distributed computation")]
struct Cli {
    /// Address the control channel listens on.
    #[arg(long, default_value = "0.0.0.0:0")]
    control_addr: SocketAddr,

    /// Minutes of silence before a session's outstanding job is considered
    /// timed out. Zero or negative disables the timer.
    #[arg(long, default_value_t = 2)]
    job_timeout: i64,

    /// Respawn dropped nodes over SSH using their retained launch metadata.
    #[arg(long)]
    respawn: bool,

    /// Local domain suffix stripped from reverse-DNS results.
    #[arg(long)]
    domain_suffix: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn init_tracing(format: LogFormat, verbose: u8) {
    let default_directive = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("VELD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    if let Err(err) = run(cli).await {
        error!(%err, "veldd exited with an error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), DaemonError> {
    let master_id = NodeId::generate().to_string();
    let ipc_dir = std::env::temp_dir();
    let router = Router::bind(&master_id, &ipc_dir, veld_transport::DEFAULT_TCP_PORT_RANGE, true).await?;

    let job_timeout_floor =
        if cli.job_timeout > 0 { Some(Duration::from_secs(cli.job_timeout as u64 * 60)) } else { None };
    let config = RegistryConfig {
        job_timeout_floor,
        respawn: cli.respawn,
        domain_suffix: cli.domain_suffix.clone(),
        master_mid: master_id.clone(),
        master_pid: std::process::id(),
    };
    let workflow: Arc<dyn Workflow> = Arc::new(DemoWorkflow::default());
    let launcher: Arc<dyn Launcher> = Arc::new(ShellLauncher::new(master_id.clone()));
    let registry = MasterRegistry::new(config, workflow, launcher);

    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<DaemonError>();
    tokio::spawn(async move {
        while let Some(err) = error_rx.recv().await {
            error!(%err, "workflow-side error");
        }
    });

    let daemon: SharedDaemon = Arc::new(Mutex::new(Daemon { registry, router }));

    let listener = TcpListener::bind(cli.control_addr).await.map_err(veld_transport::TransportError::from)?;
    let local_addr = listener.local_addr().map_err(veld_transport::TransportError::from)?;
    info!(addr = %local_addr, "control channel listening");

    tokio::spawn(data_channel_loop(daemon.clone(), error_tx.clone()));

    loop {
        let (stream, peer_addr) = listener.accept().await.map_err(veld_transport::TransportError::from)?;
        let daemon = daemon.clone();
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_control_connection(daemon, stream, peer_addr, error_tx).await {
                debug!(%peer_addr, %err, "control connection ended");
            }
        });
    }
}

/// The data channel is a single `zeromq::RouterSocket`; only this loop ever
/// calls `recv`/`send` on it, so the `Daemon` mutex is never contended by two
/// tasks both wanting the router at once. Because the pure-Rust `zeromq`
/// crate offers no way to split a `RouterSocket` into independent recv/send
/// halves (unlike a `tokio::net::TcpStream`), `recv` is polled under a short
/// timeout rather than awaited indefinitely while holding the lock — an idle
/// data channel would otherwise starve every control connection's handshake
/// and query traffic, which only ever touch the registry half of `Daemon`.
async fn data_channel_loop(daemon: SharedDaemon, error_tx: mpsc::UnboundedSender<DaemonError>) {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    loop {
        let message = {
            let mut d = daemon.lock().await;
            match tokio::time::timeout(POLL_INTERVAL, d.router.recv()).await {
                Ok(Ok(Some(message))) => Some(message),
                Ok(Ok(None)) => None,
                Ok(Err(err)) => {
                    error!(%err, "data channel recv failed");
                    None
                }
                Err(_) => None,
            }
        };
        let Some(message) = message else { continue };
        let node_id = NodeId::from(message.node_id.as_str());

        let has_session = daemon.lock().await.registry.has_session(&node_id);
        if !has_session {
            let mut d = daemon.lock().await;
            let _ = d.router.reply_error(&message.node_id, &message.command, "Unknown node ID").await;
            continue;
        }

        let is_ipc = {
            let d = daemon.lock().await;
            d.registry
                .node(&node_id)
                .and_then(|n| n.endpoint.as_deref())
                .map(|e| e.starts_with("ipc://"))
                .unwrap_or(false)
        };

        let result = match message.command.as_str() {
            "job" => dispatch::handle_job_request(&daemon, &node_id, is_ipc).await,
            "update" => dispatch::handle_update(&daemon, &node_id, message.payload).await,
            other => {
                let mut d = daemon.lock().await;
                d.router.reply_error(&message.node_id, other, "Unknown command").await.map_err(DaemonError::from)
            }
        };
        if let Err(err) = result {
            warn!(%err, node_id = %message.node_id, "data channel dispatch error");
            let _ = error_tx.send(err);
        }
    }
}

/// One line-JSON control connection for its whole lifetime: handshake,
/// queries, `change_power`, and finally the disconnect cleanup (spec.md
/// §4.4, §3 "Lifecycle").
async fn handle_control_connection(
    daemon: SharedDaemon,
    stream: TcpStream,
    peer_addr: SocketAddr,
    error_tx: mpsc::UnboundedSender<DaemonError>,
) -> Result<(), DaemonError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut node_id: Option<NodeId> = None;
    // A session that has sent a `query` may not subsequently send worker
    // commands (spec.md §4.4); `parse` flags the request shape but applying
    // the mark is the connection loop's job.
    let mut not_a_slave = false;
    let (disconnect_tx, mut disconnect_rx) = oneshot::channel();
    let mut disconnect_tx = Some(disconnect_tx);

    loop {
        let line = tokio::select! {
            line = framing::read_line(&mut reader) => line?,
            _ = &mut disconnect_rx => {
                debug!(%peer_addr, "force-disconnected");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request = match veld_wire::control::parse(&line) {
            Ok(req) => req,
            Err(err) => {
                framing::write_line(&mut write_half, &ErrorReply::new(err.to_string())).await?;
                continue;
            }
        };

        match request {
            ControlRequest::Query(raw) => {
                not_a_slave = true;
                let checksum = daemon.lock().await.registry.workflow.checksum().to_string();
                match raw.validate(&checksum) {
                    Ok(validated) => {
                        let d = daemon.lock().await;
                        let endpoints = d.router.endpoints().clone();
                        let body = control::query_response(validated.kind, &d.registry, &endpoints);
                        drop(d);
                        framing::write_line(&mut write_half, &body).await?;
                    }
                    Err(err) => {
                        framing::write_line(&mut write_half, &ErrorReply::new(err.to_string())).await?;
                    }
                }
            }
            ControlRequest::Handshake(req) => {
                if let Err(err) = control::guard_worker_command(not_a_slave) {
                    framing::write_line(&mut write_half, &ErrorReply::new(err.to_string())).await?;
                    continue;
                }
                let mut d = daemon.lock().await;
                let endpoints = d.router.endpoints().clone();
                let peer_ip = peer_addr.ip().to_string();
                let reply = control::handle_handshake(&mut d.registry, &endpoints, req, &peer_ip).await;
                match reply {
                    HandshakeReply::Rejected(err) => {
                        drop(d);
                        framing::write_line(&mut write_half, &ErrorReply::new(err.to_string())).await?;
                    }
                    HandshakeReply::Reconnected { node_id: id, supplied_data } => {
                        install_session(&mut d.registry, id.clone(), &mut disconnect_tx)?;
                        let workflow = d.registry.workflow.clone();
                        let desc = control::slave_description(&d.registry, &id);
                        drop(d);
                        framing::write_line(&mut write_half, &ReconnectOk::default()).await?;
                        if let (Some(payload), Some(desc)) = (supplied_data, desc) {
                            workflow.apply_initial_data_from_slave(payload, &desc).await;
                        }
                        node_id = Some(id);
                    }
                    HandshakeReply::Accepted { body, node_id: id, supplied_data } => {
                        install_session(&mut d.registry, id.clone(), &mut disconnect_tx)?;
                        let workflow = d.registry.workflow.clone();
                        let desc = control::slave_description(&d.registry, &id);
                        let domain_suffix = d.registry.config.domain_suffix.clone();
                        drop(d);
                        framing::write_line(&mut write_half, &body).await?;
                        if let (Some(payload), Some(desc)) = (supplied_data, desc) {
                            workflow.apply_initial_data_from_slave(payload, &desc).await;
                        }
                        spawn_reverse_dns(daemon.clone(), id.clone(), peer_addr.ip(), domain_suffix);
                        node_id = Some(id);
                    }
                }
            }
            ControlRequest::ChangePower(req) => {
                if let Err(err) = control::guard_worker_command(not_a_slave) {
                    framing::write_line(&mut write_half, &ErrorReply::new(err.to_string())).await?;
                    continue;
                }
                let mut d = daemon.lock().await;
                if let Err(err) = control::handle_change_power(&mut d.registry, node_id.as_ref(), req) {
                    drop(d);
                    framing::write_line(&mut write_half, &ErrorReply::new(err.to_string())).await?;
                }
            }
            ControlRequest::UnknownCommand(cmd) => {
                let message = format!("No responder exists for command {cmd}");
                framing::write_line(&mut write_half, &ErrorReply::new(message)).await?;
            }
        }
    }

    if let Some(id) = node_id {
        let (workflow, desc, should_respawn, should_stop) = {
            let mut d = daemon.lock().await;
            if let Some(mut session) = d.registry.remove_session(&id) {
                session.apply_event(FsmEvent::Drop).ok();
            }
            // The session is already out of the registry, so `drop`'s entry
            // action (spec.md §4.3: NodeRecord.state -> Offline) is applied
            // to the surviving NodeRecord directly rather than through
            // `apply_fsm_event`, which looks the session back up by id.
            if let Some(node) = d.registry.node_mut(&id) {
                node.state = NodeState::Offline;
            }
            d.router.forget_node(id.as_str());
            let desc = control::slave_description(&d.registry, &id);
            let should_respawn = d.registry.config.respawn && d.registry.workflow.is_running();
            let workflow = d.registry.workflow.clone();
            d.registry.maybe_evict_node(&id);
            // spec.md §4.6 "Shutdown": once the workflow is no longer
            // running and the last live session is gone, stop the master.
            let should_stop = d.registry.is_empty() && !d.registry.workflow.is_running();
            (workflow, desc, should_respawn, should_stop)
        };
        if let Some(desc) = desc {
            workflow.drop_slave(&desc).await;
        }
        if should_respawn {
            dispatch::respawn_with_backoff(daemon.clone(), id, error_tx.clone(), 1);
        }
        if should_stop {
            info!("last session gone and workflow stopped, stopping master");
            daemon.lock().await.registry.launcher.stop();
        }
    }
    Ok(())
}

/// Install a fresh `Session` for a just-handshaken node, evicting any prior
/// session for the same id first (spec.md §3 invariant 2).
fn install_session(
    registry: &mut MasterRegistry,
    id: NodeId,
    disconnect_tx: &mut Option<oneshot::Sender<()>>,
) -> Result<(), DaemonError> {
    let mut session = Session::new(id.clone());
    session.disconnect = disconnect_tx.take();
    // Only a session whose job timeout timer is actually enabled gets
    // dropped by `schedule_job_timeout` (spec.md §4.5 "Job timeout":
    // `--job-timeout <= 0` disables the timer entirely).
    session.drop_on_timeout = registry.config.job_timeout_floor.is_some();
    registry.insert_session(id.clone(), session);
    registry.apply_fsm_event(&id, FsmEvent::Connect)?;
    registry.apply_fsm_event(&id, FsmEvent::Identify)?;
    Ok(())
}

fn spawn_reverse_dns(daemon: SharedDaemon, node_id: NodeId, peer_ip: IpAddr, domain_suffix: Option<String>) {
    tokio::spawn(async move {
        let resolver = match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(err) => {
                warn!(%err, "failed to construct DNS resolver, keeping raw peer address");
                return;
            }
        };
        let host = control::resolve_peer_host(&resolver, peer_ip, domain_suffix.as_deref()).await;
        let mut d = daemon.lock().await;
        if let Some(node) = d.registry.node_mut(&node_id) {
            node.host = host;
        }
    });
}

/// Placeholder `Workflow`: never has real work, accepts every update. Stands
/// in for the external computation engine this binary doesn't implement
/// (spec.md §6.1 Non-goals) so `veldd` is runnable on its own.
#[derive(Default)]
struct DemoWorkflow;

#[async_trait]
impl Workflow for DemoWorkflow {
    fn checksum(&self) -> &str {
        "veld-demo"
    }

    fn is_running(&self) -> bool {
        true
    }

    async fn generate_initial_data_for_slave(&self, _desc: &SlaveDescription) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn apply_initial_data_from_slave(&self, _payload: serde_json::Value, _desc: &SlaveDescription) {}

    async fn generate_data_for_slave(&self, _desc: &SlaveDescription) -> JobOutcome {
        JobOutcome::NotReady
    }

    async fn apply_data_from_slave(&self, _payload: Vec<u8>, _desc: &SlaveDescription) -> bool {
        true
    }

    async fn drop_slave(&self, _desc: &SlaveDescription) {}
}

/// `Launcher` that respawns a node by shelling out to `ssh` (spec.md §4.5
/// "Respawn"), matching the original's SSH-based relaunch.
struct ShellLauncher {
    log_id: String,
}

impl ShellLauncher {
    fn new(log_id: String) -> Self {
        Self { log_id }
    }
}

#[async_trait]
impl Launcher for ShellLauncher {
    fn log_id(&self) -> &str {
        &self.log_id
    }

    async fn launch_remote_progs(
        &self,
        host: &str,
        command: &str,
        cwd: &str,
        python_path: &str,
    ) -> Result<(), LaunchError> {
        let remote_command = format!("cd {cwd} && PYTHONPATH={python_path} {command}");
        let output = Command::new("ssh")
            .arg(host)
            .arg(remote_command)
            .output()
            .await
            .map_err(|e| LaunchError::Failed(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(LaunchError::Failed(String::from_utf8_lossy(&output.stderr).into_owned()))
        }
    }

    fn stop(&self) {}
}
