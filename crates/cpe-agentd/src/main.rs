// # cpe-agentd - CPE Edge Agent Daemon
//
// This daemon is a THIN wiring layer. All reconciliation, sampling and
// reporting logic lives in cpe-core; nothing here decides what to program
// on the host.
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables and the boot files
// 2. Initializing tracing and the runtime
// 3. Building the host adapters, the store and the controller client
// 4. Registering with the controller, replaying the stored configuration
//    and pulling the current document
// 5. Running the background loops under supervision and serving the
//    Control API until SIGTERM/SIGINT
//
// ## Configuration
//
// ### Identity
// - `CPE_SN`: Serial number (when unset, read from the boot file)
// - `CPE_CORE_INFO_PATH`: Boot identity file (default `/mnt/agent/core_info.json`)
// - `CPE_CONTROLLER_ADDRESS`: Controller host (overrides the boot file)
// - `CPE_CONTROLLER_PORT`: Controller port, 0 for the scheme default
// - `CPE_CONTROLLER_PROTO`: `https` or `http`
//
// ### Host
// - `CPE_PORT_MAP_PATH`: Logical to physical port map (default `/mnt/agent/porttrans.json`)
// - `CPE_STORE_PATH`: Config store file (default `/var/lib/cpe/store.json`)
// - `CPE_COMMAND_TIMEOUT_SECS`: Limit on a single host command (default 120)
//
// ### Control API
// - `CPE_API_LISTEN_IP`: Listen address (default `0.0.0.0`)
// - `CPE_API_PORT`: Listen port (default `8001`)
//
// ### Loops
// - `CPE_SAMPLER_INTERVAL_MS`: Liveness tick
// - `CPE_FLOW_INTERVAL_SECS`: Flow sampling period
// - `CPE_HEARTBEAT_INTERVAL_SECS`: Heartbeat period
// - `CPE_CONFIG_POLL_INTERVAL_SECS`: Config poll period
// - `CPE_WAN_INTERVAL_SECS`: WAN/HA watch period
// - `CPE_RECOVER_ON_START`: Replay the stored configuration at startup (default true)
//
// ### Logging
// - `CPE_LOG_LEVEL`: trace, debug, info, warn or error (default info)
//
// ## Example
//
// ```bash
// export CPE_SN=CPE0001
// export CPE_CONTROLLER_ADDRESS=controller.example.net
// export CPE_STORE_PATH=/var/lib/cpe/store.json
//
// cpe-agentd
// ```

use anyhow::{Context, Result};
use cpe_api::ApiState;
use cpe_controller_http::HttpControllerClientFactory;
use cpe_core::config::{AgentConfig, BootInfo, ControllerProto, Identity};
use cpe_core::reconcile::ReconcileEvent;
use cpe_core::supervisor::DEFAULT_RESTART_DELAY;
use cpe_core::store::FileConfigStoreFactory;
use cpe_core::traits::{
    CommandExecutor, CommandExecutorFactory, ConfigRenderer, ConfigRendererFactory, ConfigStore,
    ConfigStoreFactory, ControllerClient, ControllerClientFactory,
};
use cpe_core::{
    AgentHealth, ConfigPoller, FlowSampler, Heartbeat, LivenessSampler, PortMap,
    ReconcileContext, Reconciler, WanWatcher, supervise,
};
use cpe_host::{FsRendererFactory, ShellExecutorFactory};
use serde_json::{Value, json};
use std::env;
use std::fmt::Display;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long background loops get to stop after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Pause before exiting when the controller refuses the first heartbeat,
/// so a service manager restart does not hammer it
const ANNOUNCE_BACKOFF: Duration = Duration::from_secs(60);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum CpeExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<CpeExitCode> for ExitCode {
    fn from(code: CpeExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration as read from the environment
#[derive(Debug, Clone)]
struct Config {
    sn: Option<String>,
    core_info_path: PathBuf,
    controller_address: Option<String>,
    controller_port: Option<u16>,
    controller_proto: Option<String>,
    port_map_path: PathBuf,
    store_path: PathBuf,
    command_timeout_secs: Option<u64>,
    api_listen_ip: String,
    api_port: u16,
    sampler_interval_ms: Option<u64>,
    flow_interval_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    config_poll_interval_secs: Option<u64>,
    wan_interval_secs: Option<u64>,
    recover_on_start: bool,
    log_level: String,
}

/// Parse an optional variable, failing on a value that does not parse
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        None => Ok(None),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> Result<bool> {
    match lookup(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{} must be true or false. Got: {}", name, v),
        },
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            sn: lookup("CPE_SN").filter(|s| !s.trim().is_empty()),
            core_info_path: lookup("CPE_CORE_INFO_PATH")
                .unwrap_or_else(|| "/mnt/agent/core_info.json".to_string())
                .into(),
            controller_address: lookup("CPE_CONTROLLER_ADDRESS").filter(|s| !s.is_empty()),
            controller_port: parse_var(&lookup, "CPE_CONTROLLER_PORT")?,
            controller_proto: lookup("CPE_CONTROLLER_PROTO").filter(|s| !s.is_empty()),
            port_map_path: lookup("CPE_PORT_MAP_PATH")
                .unwrap_or_else(|| "/mnt/agent/porttrans.json".to_string())
                .into(),
            store_path: lookup("CPE_STORE_PATH")
                .unwrap_or_else(|| "/var/lib/cpe/store.json".to_string())
                .into(),
            command_timeout_secs: parse_var(&lookup, "CPE_COMMAND_TIMEOUT_SECS")?,
            api_listen_ip: lookup("CPE_API_LISTEN_IP").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: parse_var(&lookup, "CPE_API_PORT")?.unwrap_or(8001),
            sampler_interval_ms: parse_var(&lookup, "CPE_SAMPLER_INTERVAL_MS")?,
            flow_interval_secs: parse_var(&lookup, "CPE_FLOW_INTERVAL_SECS")?,
            heartbeat_interval_secs: parse_var(&lookup, "CPE_HEARTBEAT_INTERVAL_SECS")?,
            config_poll_interval_secs: parse_var(&lookup, "CPE_CONFIG_POLL_INTERVAL_SECS")?,
            wan_interval_secs: parse_var(&lookup, "CPE_WAN_INTERVAL_SECS")?,
            recover_on_start: parse_flag(&lookup, "CPE_RECOVER_ON_START", true)?,
            log_level: lookup("CPE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("CPE_API_PORT must be between 1 and 65535");
        }

        if self.api_listen_ip.parse::<IpAddr>().is_err() {
            anyhow::bail!(
                "CPE_API_LISTEN_IP must be an IP address. Got: {}",
                self.api_listen_ip
            );
        }

        if let Some(proto) = &self.controller_proto {
            match proto.to_ascii_lowercase().as_str() {
                "http" | "https" => {}
                _ => anyhow::bail!(
                    "CPE_CONTROLLER_PROTO '{}' is not supported. Supported: http, https",
                    proto
                ),
            }
        }

        if self.store_path.as_os_str().is_empty() {
            anyhow::bail!("CPE_STORE_PATH cannot be empty");
        }

        if self.command_timeout_secs == Some(0) {
            anyhow::bail!("CPE_COMMAND_TIMEOUT_SECS must be greater than 0");
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "CPE_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn api_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .api_listen_ip
            .parse()
            .with_context(|| format!("invalid CPE_API_LISTEN_IP '{}'", self.api_listen_ip))?;
        Ok(SocketAddr::new(ip, self.api_port))
    }

    /// Identity from CPE_SN, or from the boot file when it is unset
    fn identity(&self) -> Result<Identity> {
        let mut identity = match &self.sn {
            Some(sn) => Identity {
                sn: sn.clone(),
                controller: Default::default(),
            },
            None => {
                let raw = std::fs::read_to_string(&self.core_info_path).with_context(|| {
                    format!(
                        "CPE_SN is unset and the boot file {} is unreadable",
                        self.core_info_path.display()
                    )
                })?;
                let info: BootInfo = serde_json::from_str(&raw).with_context(|| {
                    format!("boot file {} is not valid JSON", self.core_info_path.display())
                })?;
                Identity::from(info)
            }
        };

        if let Some(address) = &self.controller_address {
            identity.controller.address = address.clone();
        }
        if let Some(port) = self.controller_port {
            identity.controller.port = port;
        }
        if let Some(proto) = &self.controller_proto {
            identity.controller.proto = ControllerProto::parse(proto);
        }
        Ok(identity)
    }

    /// Build and validate the core configuration
    fn agent_config(&self) -> Result<AgentConfig> {
        let identity = self.identity()?;
        let mut config = AgentConfig::for_serial(identity.sn.clone());
        config.identity = identity;

        if let Some(ms) = self.sampler_interval_ms {
            config.sampler.interval_ms = ms;
        }
        if let Some(secs) = self.flow_interval_secs {
            config.flow.interval_secs = secs;
        }
        if let Some(secs) = self.heartbeat_interval_secs {
            config.uplink.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = self.config_poll_interval_secs {
            config.uplink.config_poll_interval_secs = secs;
        }
        if let Some(secs) = self.wan_interval_secs {
            config.wan.interval_secs = secs;
        }

        config.validate()?;
        if config.identity.controller.address.is_empty() {
            anyhow::bail!(
                "No controller address. Set CPE_CONTROLLER_ADDRESS or CoreAddress in {}",
                self.core_info_path.display()
            );
        }
        Ok(config)
    }

    /// Factory input for the config store
    fn store_settings(&self) -> Value {
        json!({ "path": self.store_path.to_string_lossy() })
    }

    /// Factory input for the shell executor; unset keys keep the defaults
    fn executor_settings(&self) -> Value {
        match self.command_timeout_secs {
            Some(secs) => json!({ "timeoutSecs": secs }),
            None => json!({}),
        }
    }

    fn level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return CpeExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return CpeExitCode::ConfigError.into();
    }

    let agent_config = match config.agent_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return CpeExitCode::ConfigError.into();
        }
    };

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CpeExitCode::ConfigError.into();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cpe-agentd");
    info!(
        sn = %agent_config.identity.sn,
        controller = %agent_config.identity.controller.url(""),
        "Configuration loaded"
    );

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CpeExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        let agent = match Agent::start(&config, agent_config).await {
            Ok(agent) => agent,
            Err(e) => {
                error!("Startup failed: {:#}", e);
                return CpeExitCode::ConfigError;
            }
        };

        if let Err(e) = agent.run().await {
            error!("Daemon error: {:#}", e);
            CpeExitCode::RuntimeError
        } else {
            CpeExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Everything the running agent shares between its loops
struct Agent {
    config: AgentConfig,
    api_addr: SocketAddr,
    store: Arc<dyn ConfigStore>,
    exec: Arc<dyn CommandExecutor>,
    files: Arc<dyn ConfigRenderer>,
    client: Arc<dyn ControllerClient>,
    health: Arc<AgentHealth>,
    reconciler: Arc<Reconciler>,
    events: mpsc::Receiver<ReconcileEvent>,
}

impl Agent {
    /// Build the collaborators, register with the controller and bring the
    /// host back to the stored configuration
    async fn start(env_config: &Config, config: AgentConfig) -> Result<Self> {
        let api_addr = env_config.api_addr()?;

        let store: Arc<dyn ConfigStore> = FileConfigStoreFactory
            .create(&env_config.store_settings())
            .await
            .with_context(|| format!("opening store {}", env_config.store_path.display()))?
            .into();
        let exec: Arc<dyn CommandExecutor> = ShellExecutorFactory
            .create(&env_config.executor_settings())
            .context("building the command executor")?
            .into();
        let files: Arc<dyn ConfigRenderer> = FsRendererFactory.create(&Value::Null)?.into();
        let client: Arc<dyn ControllerClient> = HttpControllerClientFactory
            .create(&serde_json::to_value(&config.identity.controller)?)
            .context("building the controller client")?
            .into();
        let health = Arc::new(AgentHealth::new());

        let port_map = match files.read(&env_config.port_map_path).await? {
            Some(raw) => PortMap::from_json(&raw)
                .with_context(|| format!("port map {}", env_config.port_map_path.display()))?,
            None => {
                warn!(
                    path = %env_config.port_map_path.display(),
                    "port map missing, only sysfs interface names will resolve"
                );
                PortMap::default()
            }
        };
        info!(
            wans = port_map.wans.len(),
            lans = port_map.lans.len(),
            "Port map loaded"
        );

        let ctx = ReconcileContext::new(
            &config,
            store.clone(),
            exec.clone(),
            files.clone(),
            Arc::new(port_map),
            health.clone(),
        );
        let (reconciler, events) = Reconciler::new(ctx);
        let reconciler = Arc::new(reconciler);

        let heartbeat = Heartbeat::new(&config, client.clone(), health.clone());
        if let Err(e) = heartbeat.announce().await {
            error!("{}", e);
            info!("Waiting {:?} before exiting", ANNOUNCE_BACKOFF);
            tokio::time::sleep(ANNOUNCE_BACKOFF).await;
            return Err(e.into());
        }

        if env_config.recover_on_start {
            info!("Replaying stored configuration");
            if let Err(e) = reconciler.recover().await {
                warn!(error = %e, "Recovery incomplete");
            }
        }

        let poller = ConfigPoller::new(&config, client.clone(), reconciler.clone());
        match poller.fetch().await {
            Ok(outcome) => info!(failures = outcome.failures, "Initial configuration applied"),
            Err(e) => warn!(error = %e, "Initial configuration pull failed, will retry"),
        }

        Ok(Self {
            config,
            api_addr,
            store,
            exec,
            files,
            client,
            health,
            reconciler,
            events,
        })
    }

    /// Run every loop and the Control API until a shutdown signal
    async fn run(self) -> Result<()> {
        let Agent {
            config,
            api_addr,
            store,
            exec,
            files,
            client,
            health,
            reconciler,
            events,
        } = self;

        tokio::spawn(log_events(events));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops: JoinSet<(&'static str, usize)> = JoinSet::new();

        {
            let (config, store, exec, files, client) =
                (config.clone(), store.clone(), exec.clone(), files.clone(), client.clone());
            spawn_supervised(&mut loops, "liveness", health.clone(), shutdown_rx.clone(), move |rx| {
                LivenessSampler::new(&config, store.clone(), exec.clone(), files.clone(), client.clone())
                    .run(rx)
            });
        }
        {
            let (config, store, exec, files) =
                (config.clone(), store.clone(), exec.clone(), files.clone());
            spawn_supervised(&mut loops, "flow", health.clone(), shutdown_rx.clone(), move |rx| {
                FlowSampler::new(&config, store.clone(), exec.clone(), files.clone()).run(rx)
            });
        }
        {
            let (config, client, beat_health) = (config.clone(), client.clone(), health.clone());
            spawn_supervised(&mut loops, "heartbeat", health.clone(), shutdown_rx.clone(), move |rx| {
                Heartbeat::new(&config, client.clone(), beat_health.clone()).run(rx)
            });
        }
        {
            let (config, client, reconciler) = (config.clone(), client.clone(), reconciler.clone());
            spawn_supervised(&mut loops, "config-poll", health.clone(), shutdown_rx.clone(), move |rx| {
                ConfigPoller::new(&config, client.clone(), reconciler.clone()).run(rx)
            });
        }
        {
            let (config, client, reconciler) = (config.clone(), client.clone(), reconciler.clone());
            spawn_supervised(&mut loops, "wan", health.clone(), shutdown_rx.clone(), move |rx| {
                WanWatcher::new(&config, reconciler.clone(), client.clone()).run(rx)
            });
        }

        let mut api = tokio::spawn(cpe_api::serve(
            api_addr,
            ApiState::new(reconciler.clone()),
            shutdown_rx.clone(),
        ));

        info!("Daemon initialized successfully");

        let mut api_done = false;
        let outcome: Result<()> = tokio::select! {
            signal = wait_for_shutdown() => {
                signal.map(|name| info!("Received shutdown signal: {}", name))
            }
            joined = &mut api => {
                api_done = true;
                match joined {
                    Ok(Ok(())) => Err(anyhow::anyhow!("control API stopped unexpectedly")),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("control API failed")),
                    Err(e) => Err(anyhow::anyhow!("control API task failed: {}", e)),
                }
            }
        };

        info!("Shutting down daemon");
        let _ = shutdown_tx.send(true);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = loops.join_next().await {
                match joined {
                    Ok((name, restarts)) => info!(loop_name = name, restarts, "loop stopped"),
                    Err(e) => warn!("loop task failed: {}", e),
                }
            }
            if !api_done {
                let _ = (&mut api).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown timeout after {:?}, abandoning remaining tasks", SHUTDOWN_GRACE);
            loops.abort_all();
            api.abort();
        }

        if let Err(e) = store.flush().await {
            warn!(error = %e, "Final store flush failed");
        }

        outcome
    }
}

/// Spawn a loop under [`supervise`], reporting its name and restart count when it ends
fn spawn_supervised<F, Fut>(
    set: &mut JoinSet<(&'static str, usize)>,
    name: &'static str,
    health: Arc<AgentHealth>,
    shutdown: watch::Receiver<bool>,
    factory: F,
) where
    F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: Future<Output = cpe_core::Result<()>> + Send + 'static,
{
    set.spawn(async move {
        let restarts = supervise(name, health, shutdown, DEFAULT_RESTART_DELAY, factory).await;
        (name, restarts)
    });
}

/// Log reconciler events until the reconciler is dropped
async fn log_events(events: mpsc::Receiver<ReconcileEvent>) {
    let mut events = ReceiverStream::new(events);
    while let Some(event) = events.next().await {
        match event {
            ReconcileEvent::Failed { key, error } => warn!(%key, %error, "object failed"),
            ReconcileEvent::PassCompleted { failures } if failures > 0 => {
                warn!(failures, "configuration pass finished with failures")
            }
            other => debug!(event = ?other, "reconcile event"),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
