//! MITM proxy server.
//!
//! Owns the TLS-terminating proxy loop and wires the dispatch handler to
//! the route table, smart cache, and event bus.

use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::sync::broadcast;

use wayfarer_core::{EventBus, ProxyEvent, TrafficDisplay};

use crate::ca::CaManager;
use crate::cache::SmartCache;
use crate::error::{ProxyError, Result};
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::routes::RouteTable;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for leaf certificate generation.
    pub ca_manager: CaManager,
    /// Compiled rewrite handlers.
    pub routes: Arc<RouteTable>,
    /// Smart cache, if enabled.
    pub cache: Option<Arc<SmartCache>>,
    /// Outbound event stream.
    pub events: EventBus,
    /// Which traffic is surfaced as events.
    pub traffic_display: TrafficDisplay,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("ca_manager", &self.ca_manager)
            .field("routes", &self.routes.handler_counts())
            .field("cache", &self.cache.is_some())
            .field("traffic_display", &self.traffic_display)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration with the given CA manager and an otherwise
    /// bare pipeline: no handlers, no cache, events to a fresh bus.
    pub fn new(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            routes: Arc::new(RouteTable::empty()),
            cache: None,
            events: EventBus::new(),
            traffic_display: TrafficDisplay::default(),
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (binds to 127.0.0.1).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the route table.
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = Arc::new(routes);
        self
    }

    /// Sets the smart cache.
    pub fn with_cache(mut self, cache: Arc<SmartCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the event bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Sets the traffic display policy.
    pub fn with_traffic_display(mut self, traffic_display: TrafficDisplay) -> Self {
        self.traffic_display = traffic_display;
        self
    }
}

/// MITM proxy server for the configured game-service umbrella.
pub struct ProxyServer {
    config: ProxyConfig,
}

impl ProxyServer {
    /// Creates a new proxy server, ensuring CA material exists up front.
    ///
    /// CA construction failures here are fatal; nothing else is.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.ca_manager.ensure_ca()?;
        Ok(Self { config })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for trust-store installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Returns the CA certificate as DER bytes.
    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        Ok(self.config.ca_manager.read_cert_der()?)
    }

    fn handler(&self) -> ProxyHandler {
        ProxyHandler::new(HandlerConfig {
            routes: Arc::clone(&self.config.routes),
            cache: self.config.cache.clone(),
            events: self.config.events.clone(),
            traffic_display: self.config.traffic_display,
        })
    }

    /// Starts the proxy server and blocks until it shuts down.
    pub async fn run(self) -> Result<()> {
        let authority = self.config.ca_manager.ensure_ca()?;
        let handler = self.handler();

        tracing::info!("starting MITM proxy on {}", self.config.addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        let proxy = Proxy::builder()
            .with_addr(self.config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background and returns a control
    /// handle.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown = shutdown_tx.clone();
        let addr = self.config.addr;

        // Load CA before spawning so startup failures stay synchronous.
        let authority = self.config.ca_manager.ensure_ca()?;
        let handler = self.handler();
        let events = self.config.events.clone();

        let handle = tokio::spawn(async move {
            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(proxy) => proxy,
                Err(e) => {
                    tracing::error!("failed to build proxy: {}", e);
                    events.emit(ProxyEvent::status(format!("proxy failed to start: {}", e)));
                    return;
                }
            };

            let mut shutdown_rx = shutdown.subscribe();

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("proxy error: {}", e);
                        events.emit(ProxyEvent::status(format!("proxy error: {}", e)));
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
