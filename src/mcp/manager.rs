//! Lifecycle management for a set of named MCP servers
//!
//! [`McpManager`] owns the configured servers, one [`McpClient`] per
//! connected server, the aggregate tool list, and per-server health records.
//!
//! All mutable state sits behind a single `tokio::sync::RwLock`. Network
//! work (spawning, handshaking, listing tools, closing) never happens while
//! that lock is held: connections are built first and installed afterwards
//! in one short write section. The health monitor handle lives behind its
//! own mutex so status reads never wait on monitor management.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::mcp::config::{McpConfig, McpServerConfig, TransportKind};
use crate::mcp::health::{HealthTransition, ServerHealth, UNHEALTHY_THRESHOLD};
use crate::mcp::protocol::{ClientState, McpClient, ServerCapabilityFlag};
use crate::mcp::tool_adapter::McpToolAdapter;
use crate::mcp::transport::{
    EnvPolicy, HttpTransport, StdioServerParams, StdioTransport, Transport,
};
use crate::mcp::types::{CallToolResponse, Implementation, McpTool};
use crate::tools::{ToolExecutor, ToolRegistry};

/// How long `stop_health_monitor` waits for the task before aborting it.
const MONITOR_STOP_WAIT: Duration = Duration::from_secs(5);

/// Builds the transport for one server.
///
/// The default implementation spawns stdio children and opens HTTP
/// sessions; tests substitute in-process fakes.
#[async_trait]
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// Open a transport for `config`.
    async fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn Transport>>;
}

/// Factory for the real stdio and HTTP transports.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    env_policy: EnvPolicy,
    request_timeout: Option<Duration>,
}

impl DefaultTransportFactory {
    /// Use `policy` for stdio child environments.
    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.env_policy = policy;
        self
    }

    /// HTTP client timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn Transport>> {
        match config.transport {
            TransportKind::Stdio => {
                let command = config.command.clone().unwrap_or_default();
                let mut params = StdioServerParams::new(&config.name, command)
                    .with_args(config.args.iter().cloned())
                    .with_env(config.env.clone())
                    .with_env_policy(self.env_policy.clone());
                if let Some(dir) = &config.working_dir {
                    params = params.with_working_dir(dir);
                }
                Ok(Arc::new(StdioTransport::spawn(params)?))
            }
            TransportKind::Http => {
                let raw = config.url.as_deref().unwrap_or_default();
                let endpoint = url::Url::parse(raw).map_err(|e| {
                    BridgeError::Config(format!(
                        "MCP server `{}`: invalid url `{}`: {}",
                        config.name, raw, e
                    ))
                })?;
                let timeout = config
                    .timeout_seconds
                    .map(Duration::from_secs)
                    .or(self.request_timeout)
                    .unwrap_or(Duration::from_secs(30));
                Ok(Arc::new(HttpTransport::new(
                    &config.name,
                    endpoint,
                    config.headers.clone(),
                    timeout,
                )?))
            }
        }
    }
}

/// A freshly handshaken client and its tool snapshot.
#[derive(Debug)]
struct Connection {
    client: Arc<McpClient>,
    tools: Vec<McpTool>,
}

/// Opens transports and runs connect -> initialize -> list tools.
#[derive(Debug, Clone)]
struct Connector {
    factory: Arc<dyn TransportFactory>,
    client_info: Implementation,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Connector {
    /// Connect one server, bounded by the connect timeout and `parent`.
    ///
    /// The client is closed before returning on any failure.
    async fn connect(&self, parent: &CancellationToken, config: &McpServerConfig) -> Result<Connection> {
        let ct = parent.child_token();
        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        let timed_out = || -> anyhow::Error {
            BridgeError::McpTimeout {
                server: config.name.clone(),
                method: "connect".to_string(),
            }
            .into()
        };

        let transport = tokio::time::timeout_at(deadline, self.factory.create(config))
            .await
            .map_err(|_| timed_out())??;

        let request_timeout = config
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.request_timeout);
        let client = Arc::new(
            McpClient::new(&config.name, transport)
                .with_request_timeout(request_timeout)
                .with_client_info(self.client_info.clone()),
        );

        let setup = async {
            client.initialize(&ct).await?;
            if client.capable(ServerCapabilityFlag::Tools) {
                client.list_tools(&ct).await
            } else {
                Ok(Vec::new())
            }
        };

        let outcome = match tokio::time::timeout_at(deadline, setup).await {
            Ok(result) => result,
            Err(_) => {
                ct.cancel();
                Err(timed_out())
            }
        };

        match outcome {
            Ok(tools) => Ok(Connection { client, tools }),
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    tracing::debug!(server = %config.name, error = %close_err, "close after failed connect");
                }
                Err(e)
            }
        }
    }
}

/// One tool in the aggregate list, tagged with its server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredTool {
    /// Server that advertised the tool
    pub server: String,
    /// The tool descriptor
    pub tool: McpTool,
}

#[derive(Debug, Default)]
struct Registry {
    clients: HashMap<String, Arc<McpClient>>,
    tools: Vec<RegisteredTool>,
    health: HashMap<String, ServerHealth>,
}

impl Registry {
    fn replace_tools(&mut self, server: &str, tools: Vec<McpTool>) {
        self.tools.retain(|t| t.server != server);
        self.tools.extend(tools.into_iter().map(|tool| RegisteredTool {
            server: server.to_string(),
            tool,
        }));
    }

    /// Install a connection; returns the client it displaced, if any.
    fn install(&mut self, server: &str, connection: Connection) -> Option<Arc<McpClient>> {
        self.replace_tools(server, connection.tools);
        self.clients.insert(server.to_string(), connection.client)
    }

    fn remove(&mut self, server: &str) -> Option<Arc<McpClient>> {
        self.tools.retain(|t| t.server != server);
        self.clients.remove(server)
    }
}

#[derive(Debug)]
struct MonitorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    async fn stop(mut self) {
        self.cancel.cancel();
        if tokio::time::timeout(MONITOR_STOP_WAIT, &mut self.handle)
            .await
            .is_err()
        {
            tracing::warn!("health monitor did not stop in time; aborting");
            self.handle.abort();
        }
    }
}

/// Status of one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Server name
    pub name: String,
    /// Transport kind
    pub transport: TransportKind,
    /// Whether `connect_all` picks this server up
    pub auto_connect: bool,
    /// Whether a client is installed
    pub connected: bool,
    /// Client lifecycle state, when connected
    pub state: Option<ClientState>,
    /// Health record, once the health tick has seen the server
    pub health: Option<ServerHealth>,
    /// Identity reported during the handshake
    pub server_info: Option<Implementation>,
    /// Names of the tools this server contributes
    pub tools: Vec<String>,
}

/// Owns every configured MCP server connection.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use mcpbridge::mcp::config::{McpConfig, McpServerConfig};
/// use mcpbridge::mcp::manager::McpManager;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let config = McpConfig {
///     servers: vec![McpServerConfig::stdio("fs", "mcp-fs").with_args(["/tmp"])],
///     ..McpConfig::default()
/// };
/// let manager = Arc::new(McpManager::new(config));
/// manager.connect_all(&CancellationToken::new()).await?;
/// for tool in manager.tools().await {
///     println!("{}: {}", tool.server, tool.tool.name);
/// }
/// manager.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct McpManager {
    config: McpConfig,
    connector: Connector,
    registry: RwLock<Registry>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl McpManager {
    /// Manager using the real stdio and HTTP transports.
    pub fn new(config: McpConfig) -> Self {
        let factory = DefaultTransportFactory::default().with_request_timeout(config.request_timeout());
        Self::with_transport_factory(config, Arc::new(factory))
    }

    /// Manager using a custom transport factory.
    pub fn with_transport_factory(config: McpConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let connector = Connector {
            factory,
            client_info: Implementation::this_client(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        };
        Self {
            config,
            connector,
            registry: RwLock::new(Registry::default()),
            monitor: Mutex::new(None),
        }
    }

    /// The configuration this manager was built from.
    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    fn server_config(&self, name: &str) -> Result<&McpServerConfig> {
        self.config
            .server(name)
            .ok_or_else(|| BridgeError::McpServerNotFound(name.to_string()).into())
    }

    fn reconnect_ceiling(&self, name: &str) -> u32 {
        self.config
            .server(name)
            .and_then(|s| s.max_retries)
            .unwrap_or(self.config.max_reconnect_attempts)
    }

    /// The client for `name`, if connected.
    pub async fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.registry.read().await.clients.get(name).cloned()
    }

    /// Whether `name` has an installed client.
    pub async fn is_connected(&self, name: &str) -> bool {
        self.registry.read().await.clients.contains_key(name)
    }

    async fn close_all(clients: Vec<(String, Arc<McpClient>)>) -> Vec<(String, String)> {
        let closes = clients.into_iter().map(|(name, client)| async move {
            client.close().await.err().map(|e| (name, format!("{:#}", e)))
        });
        futures::future::join_all(closes)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Connect every `auto_connect` server that is not already connected.
    ///
    /// Servers connect concurrently; each is bounded by the connect timeout
    /// and by `ct`. Successful connections are installed even when others
    /// fail.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Aggregate`] listing every server that failed.
    pub async fn connect_all(&self, ct: &CancellationToken) -> Result<()> {
        let connected: HashSet<String> = self.registry.read().await.clients.keys().cloned().collect();

        let mut tasks = JoinSet::new();
        for config in self
            .config
            .servers
            .iter()
            .filter(|s| s.auto_connect && !connected.contains(&s.name))
        {
            let connector = self.connector.clone();
            let config = config.clone();
            let ct = ct.clone();
            tasks.spawn(async move {
                let result = connector.connect(&ct, &config).await;
                (config.name, result)
            });
        }

        let mut connections = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(connection))) => {
                    tracing::info!(server = %name, tools = connection.tools.len(), "connected MCP server");
                    connections.push((name, connection));
                }
                Ok((name, Err(e))) => {
                    tracing::warn!(server = %name, error = %format!("{:#}", e), "failed to connect MCP server");
                    failures.push((name, format!("{:#}", e)));
                }
                Err(e) => {
                    tracing::error!(error = %e, "MCP connect task panicked");
                    failures.push(("<connect task>".to_string(), e.to_string()));
                }
            }
        }

        let displaced: Vec<(String, Arc<McpClient>)> = {
            let mut registry = self.registry.write().await;
            connections
                .into_iter()
                .filter_map(|(name, connection)| {
                    registry
                        .install(&name, connection)
                        .map(|old| (name, old))
                })
                .collect()
        };
        Self::close_all(displaced).await;

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(BridgeError::Aggregate {
                operation: "connect_all".to_string(),
                failures,
            }
            .into())
        }
    }

    /// Connect a single configured server. A no-op if already connected.
    pub async fn connect(&self, ct: &CancellationToken, name: &str) -> Result<()> {
        let config = self.server_config(name)?.clone();
        if self.is_connected(name).await {
            return Ok(());
        }

        let connection = self.connector.connect(ct, &config).await?;
        tracing::info!(server = %name, tools = connection.tools.len(), "connected MCP server");
        let displaced = self.registry.write().await.install(name, connection);
        if let Some(old) = displaced {
            Self::close_all(vec![(name.to_string(), old)]).await;
        }
        Ok(())
    }

    /// Remove a server's tools and close its client.
    ///
    /// A no-op for servers that are not connected.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let client = {
            let mut registry = self.registry.write().await;
            registry.health.remove(name);
            registry.remove(name)
        };
        if let Some(client) = client {
            client.close().await?;
            tracing::info!(server = %name, "disconnected MCP server");
        }
        Ok(())
    }

    /// Re-list a server's tools and replace its slice of the aggregate list.
    ///
    /// Returns the number of tools now registered for the server.
    pub async fn refresh_tools(&self, ct: &CancellationToken, name: &str) -> Result<usize> {
        let client = self
            .client(name)
            .await
            .ok_or_else(|| BridgeError::McpServerNotFound(name.to_string()))?;
        let tools = client.list_tools(ct).await?;
        let count = tools.len();

        let mut registry = self.registry.write().await;
        let still_current = registry
            .clients
            .get(name)
            .map_or(false, |c| Arc::ptr_eq(c, &client));
        if !still_current {
            return Err(BridgeError::McpClosed(format!(
                "MCP server `{}` was reconnected or disconnected during refresh",
                name
            ))
            .into());
        }
        registry.replace_tools(name, tools);
        tracing::debug!(server = %name, tools = count, "refreshed MCP tools");
        Ok(count)
    }

    /// Run one health tick: update every record, then reconnect unhealthy
    /// servers that are still below their ceiling.
    pub async fn check_health(&self, ct: &CancellationToken) {
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut registry = self.registry.write().await;
            let Registry {
                clients, health, ..
            } = &mut *registry;

            for (name, client) in clients.iter() {
                let record = health
                    .entry(name.clone())
                    .or_insert_with(|| ServerHealth::new(self.reconnect_ceiling(name)));
                let transition = record.observe(
                    client.consecutive_failures(),
                    client.is_alive(),
                    UNHEALTHY_THRESHOLD,
                    now,
                );
                match transition {
                    HealthTransition::BecameUnhealthy => tracing::warn!(
                        server = %name,
                        consecutive_failures = record.consecutive_failures,
                        alive = client.is_alive(),
                        "MCP server became unhealthy"
                    ),
                    HealthTransition::Recovered => {
                        tracing::info!(server = %name, "MCP server recovered")
                    }
                    HealthTransition::None => {}
                }
            }

            for (name, record) in health.iter_mut() {
                if !clients.contains_key(name) {
                    record.mark_disconnected(now);
                }
                let retry_delay = self
                    .config
                    .server(name)
                    .map(|s| s.retry_delay())
                    .unwrap_or_default();
                if record.can_retry(retry_delay, now) {
                    due.push(name.clone());
                }
            }
        }

        futures::future::join_all(due.iter().map(|name| self.reconnect(ct, name))).await;
    }

    async fn reconnect(&self, ct: &CancellationToken, name: &str) {
        let Some(config) = self.config.server(name).cloned() else {
            return;
        };

        let (old, attempt, ceiling) = {
            let mut registry = self.registry.write().await;
            let Some(record) = registry.health.get_mut(name) else {
                return;
            };
            let now = Utc::now();
            if !record.can_retry(config.retry_delay(), now) {
                return;
            }
            record.begin_attempt(now);
            let attempt = record.reconnect_attempts;
            let ceiling = record.max_reconnect_attempts;
            (registry.remove(name), attempt, ceiling)
        };

        if let Some(old) = old {
            if let Err(e) = old.close().await {
                tracing::debug!(server = %name, error = %e, "closing unhealthy client");
            }
        }

        tracing::info!(server = %name, attempt, max_attempts = ceiling, "reconnecting MCP server");
        match self.connector.connect(ct, &config).await {
            Ok(connection) => {
                let displaced = {
                    let mut registry = self.registry.write().await;
                    match registry.health.get_mut(name) {
                        Some(record) => {
                            record.mark_reconnected(Utc::now());
                            Ok(registry.install(name, connection))
                        }
                        // Disconnected while the reconnect was in flight.
                        None => Err(connection.client),
                    }
                };
                match displaced {
                    Ok(old) => {
                        tracing::info!(server = %name, attempt, "reconnected MCP server");
                        if let Some(old) = old {
                            Self::close_all(vec![(name.to_string(), old)]).await;
                        }
                    }
                    Err(orphan) => {
                        Self::close_all(vec![(name.to_string(), orphan)]).await;
                    }
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                let mut registry = self.registry.write().await;
                if let Some(record) = registry.health.get_mut(name) {
                    record.last_error = Some(message.clone());
                    if record.exhausted() {
                        tracing::error!(
                            server = %name,
                            attempts = record.reconnect_attempts,
                            error = %message,
                            "giving up on MCP server after reaching reconnect limit"
                        );
                    } else {
                        tracing::warn!(server = %name, attempt, error = %message, "reconnect failed");
                    }
                }
            }
        }
    }

    /// Start the background health monitor, replacing any running one.
    ///
    /// The task holds only a weak reference and exits on its own once the
    /// manager is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if `interval` is zero.
    pub async fn start_health_monitor(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(
                BridgeError::Config("health check interval must be greater than 0".to_string())
                    .into(),
            );
        }

        let mut slot = self.monitor.lock().await;
        if let Some(old) = slot.take() {
            old.stop().await;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.check_health(&token).await;
            }
            tracing::debug!("health monitor stopped");
        });

        tracing::debug!(interval_ms = interval.as_millis() as u64, "health monitor started");
        *slot = Some(MonitorHandle { cancel, handle });
        Ok(())
    }

    /// Stop the health monitor, if running.
    pub async fn stop_health_monitor(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Whether a health monitor task is installed.
    pub async fn health_monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .map_or(false, |m| !m.handle.is_finished())
    }

    /// Status of every configured server, in configuration order.
    pub async fn get_server_status(&self) -> Vec<ServerStatus> {
        let registry = self.registry.read().await;
        self.config
            .servers
            .iter()
            .map(|config| {
                let client = registry.clients.get(&config.name);
                ServerStatus {
                    name: config.name.clone(),
                    transport: config.transport,
                    auto_connect: config.auto_connect,
                    connected: client.is_some(),
                    state: client.map(|c| c.state()),
                    health: registry.health.get(&config.name).cloned(),
                    server_info: client.and_then(|c| c.server_info()),
                    tools: registry
                        .tools
                        .iter()
                        .filter(|t| t.server == config.name)
                        .map(|t| t.tool.name.clone())
                        .collect(),
                }
            })
            .collect()
    }

    /// Stop the monitor and close every client.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Aggregate`] if any client failed to close;
    /// every client is still removed.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_health_monitor().await;

        let clients: Vec<(String, Arc<McpClient>)> = {
            let mut registry = self.registry.write().await;
            registry.tools.clear();
            registry.health.clear();
            registry.clients.drain().collect()
        };
        let count = clients.len();
        let mut failures = Self::close_all(clients).await;
        tracing::info!(servers = count, "MCP manager shut down");

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(BridgeError::Aggregate {
                operation: "shutdown".to_string(),
                failures,
            }
            .into())
        }
    }

    /// Snapshot of the aggregate tool list.
    pub async fn tools(&self) -> Vec<RegisteredTool> {
        self.registry.read().await.tools.clone()
    }

    /// One adapter per registered tool.
    pub async fn tool_adapters(&self) -> Vec<McpToolAdapter> {
        let registry = self.registry.read().await;
        registry
            .tools
            .iter()
            .filter_map(|entry| {
                let client = registry.clients.get(&entry.server)?;
                let prefix = self
                    .config
                    .server(&entry.server)
                    .map(|c| c.effective_tool_prefix());
                Some(McpToolAdapter::new(
                    Arc::clone(client),
                    &entry.server,
                    prefix,
                    entry.tool.clone(),
                ))
            })
            .collect()
    }

    /// Register every MCP tool into `registry`; returns how many were added.
    ///
    /// A name already present in `registry` is left untouched: the first
    /// registration wins and the colliding adapter is skipped with a warning.
    pub async fn register_tools(&self, registry: &mut ToolRegistry) -> usize {
        let mut added = 0;
        for adapter in self.tool_adapters().await {
            if registry.get(adapter.name()).is_some() {
                tracing::warn!(
                    tool = %adapter.name(),
                    server = %adapter.server(),
                    "tool name collision; keeping the first registration"
                );
                continue;
            }
            registry.register(Arc::new(adapter));
            added += 1;
        }
        added
    }

    /// Call `tool` on `server` directly.
    ///
    /// Updates the client's failure streak the same way the adapter does.
    pub async fn call_tool(
        &self,
        ct: &CancellationToken,
        server: &str,
        tool: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResponse> {
        let client = self
            .client(server)
            .await
            .ok_or_else(|| BridgeError::McpServerNotFound(server.to_string()))?;
        match client.call_tool(ct, tool, arguments).await {
            Ok(response) => {
                client.record_success();
                Ok(response)
            }
            Err(e) => {
                client.record_call_error(&e);
                Err(e)
            }
        }
    }
}
