//! Hosting loop: one listener generation per restart-worthy configuration.
//!
//! Each generation initializes the enabled plugins, subscribes their event
//! hooks and serves the router built from them. Hot-reloadable changes flow
//! through the live [`ConfigManager`] snapshot and are pushed onto the event
//! bus; a new topic prefix resubscribes the hooks in place. Changes to the
//! base URL, base path or transport tear the generation down and start a new
//! one, rebuilding the transport when its kind changed.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use authplane_config::{ConfigManager, Configuration, PluginContext};
use authplane_events::{CancelHandle, CancelToken, Subscription};
use authplane_plugins::PluginRegistry;
use authplane_ratelimit::RateLimiter;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{self, Services};
use crate::error::{AppError, AppResult};
use crate::http::{self, AppState};

/// Time a generation gets to drain in-flight requests.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Serve until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error when a generation cannot start or a listener fails.
pub async fn run(services: Services) -> AppResult<()> {
    run_until(services, wait_for_signal()).await
}

/// Serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error when a generation cannot start or a listener fails.
pub async fn run_until<F>(services: Services, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stop = Arc::new(CancelHandle::new());
    let signal = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            shutdown.await;
            stop.cancel();
        })
    };
    let token = stop.token();
    let mut snapshots = services.config.watch(token.clone());
    let sampler = spawn_stats_sampler(&services, token.clone());

    let result = serve_generations(&services, &token, &mut snapshots).await;

    stop.cancel();
    signal.abort();
    if let Err(err) = sampler.await {
        warn!(error = %err, "stats sampler ended abnormally");
    }
    if let Err(err) = services.bus.close().await {
        warn!(error = ?err, "failed to close event bus");
    }
    info!("authplane stopped");
    result
}

enum Exit {
    Shutdown,
    Restart,
    Resubscribe,
    Served(Result<std::io::Result<()>, tokio::task::JoinError>),
}

async fn serve_generations(
    services: &Services,
    shutdown: &CancelToken,
    snapshots: &mut mpsc::Receiver<Arc<Configuration>>,
) -> AppResult<()> {
    let mut active = services.config.config();
    loop {
        let started_with = Arc::clone(&active);
        let mut generation = Generation::start(services).await?;
        let exit = loop {
            let exit = tokio::select! {
                () = shutdown.cancelled() => Exit::Shutdown,
                exit = next_restart(services, &mut active, snapshots) => exit,
                joined = &mut generation.server => Exit::Served(joined),
            };
            if !matches!(exit, Exit::Resubscribe) {
                break exit;
            }
            if let Err(err) = generation.resubscribe().await {
                generation.stop().await;
                return Err(err);
            }
        };
        match exit {
            Exit::Restart => {
                generation.stop().await;
                if started_with.event_bus.transport != active.event_bus.transport {
                    rebuild_transport(services, &active).await?;
                }
                services.metrics.inc_server_restart();
                info!("restarting listener for new configuration");
            }
            Exit::Resubscribe => {}
            Exit::Shutdown => {
                generation.stop().await;
                return Ok(());
            }
            Exit::Served(joined) => {
                generation.release().await;
                return match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(AppError::io("server.serve", source)),
                    Err(err) => {
                        error!(error = %err, "listener task failed");
                        Err(AppError::io("server.serve", std::io::Error::other(err)))
                    }
                };
            }
        }
    }
}

/// Consume snapshots until one needs a restart or a resubscribe. Everything
/// else is applied in place through the live configuration and the bus.
async fn next_restart(
    services: &Services,
    active: &mut Arc<Configuration>,
    snapshots: &mut mpsc::Receiver<Arc<Configuration>>,
) -> Exit {
    while let Some(snapshot) = snapshots.recv().await {
        let started = Instant::now();
        let restart = ConfigManager::requires_restart(active, &snapshot);
        let options = bootstrap::bus_options(&snapshot);
        let previous = services.bus.options();
        let prefix_changed = previous.prefix != options.prefix;
        if prefix_changed || previous.max_concurrent_handlers != options.max_concurrent_handlers {
            services.bus.reconfigure(options);
        }
        *active = snapshot;
        if restart {
            return Exit::Restart;
        }
        services.metrics.inc_config_reload();
        services
            .metrics
            .observe_config_apply_latency(started.elapsed());
        if prefix_changed {
            return Exit::Resubscribe;
        }
        debug!("configuration reloaded in place");
    }
    Exit::Shutdown
}

/// Swap in the transport `config` names and close the one it replaces.
async fn rebuild_transport(services: &Services, config: &Configuration) -> AppResult<()> {
    let transport = bootstrap::select_transport(config)?;
    let previous = services.bus.replace_transport(Arc::clone(&transport));
    if Arc::ptr_eq(&previous, &transport) {
        return Ok(());
    }
    if let Err(err) = previous.close().await {
        warn!(error = ?err, "failed to close replaced transport");
    }
    info!(transport = %config.event_bus.transport, "event transport rebuilt");
    Ok(())
}

struct Generation {
    registry: PluginRegistry,
    hooks: Hooks,
    stop: CancelHandle,
    server: JoinHandle<std::io::Result<()>>,
}

/// Event hook subscriptions of one generation.
struct Hooks {
    cancel: CancelHandle,
    subscriptions: Vec<Subscription>,
}

impl Hooks {
    async fn subscribe(registry: &PluginRegistry) -> AppResult<Self> {
        let cancel = CancelHandle::new();
        match registry.subscribe_event_hooks(&cancel.token()).await {
            Ok(subscriptions) => Ok(Self {
                cancel,
                subscriptions,
            }),
            Err(err) => {
                cancel.cancel();
                Err(AppError::plugin("plugins.subscribe", err))
            }
        }
    }

    async fn release(self) {
        self.cancel.cancel();
        for subscription in self.subscriptions {
            subscription.unsubscribe().await;
        }
    }
}

impl Generation {
    async fn start(services: &Services) -> AppResult<Self> {
        let registry = PluginRegistry::from_config(PluginContext {
            config: services.config.clone(),
            event_bus: services.bus.clone(),
            db: services.pool.clone(),
        });
        if let Some(pool) = &services.pool {
            registry
                .run_migrations(pool)
                .await
                .map_err(|err| AppError::plugin("plugins.migrate", err))?;
        }
        registry
            .init_all()
            .await
            .map_err(|err| AppError::plugin("plugins.init", err))?;

        let hooks = match Hooks::subscribe(&registry).await {
            Ok(hooks) => hooks,
            Err(err) => {
                let _failures = registry.close_all().await;
                return Err(err);
            }
        };

        let limiter = RateLimiter::new(
            services.config.clone(),
            Arc::clone(&services.storage),
            registry.rate_limits(),
        );
        let state = AppState {
            config: services.config.clone(),
            metrics: services.metrics.clone(),
            bus: services.bus.clone(),
            admin_api_key: Arc::clone(&services.admin_api_key),
        };
        let plugin_routes = match registry.router() {
            Ok(routes) => routes,
            Err(err) => {
                hooks.release().await;
                let _failures = registry.close_all().await;
                return Err(AppError::plugin("plugins.router", err));
            }
        };
        let base_path = services.config.config().base_path.clone();
        let router = http::build_router(state, plugin_routes, limiter, &base_path);

        let addr = SocketAddr::from(([0, 0, 0, 0], services.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                hooks.release().await;
                let _failures = registry.close_all().await;
                return Err(AppError::io("server.bind", source));
            }
        };
        let local = listener.local_addr().unwrap_or(addr);
        info!(addr = %local, base_path = %base_path, plugins = registry.plugins().len(), "listening");

        let stop = CancelHandle::new();
        let token = stop.token();
        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        });

        Ok(Self {
            registry,
            hooks,
            stop,
            server,
        })
    }

    /// Move the event hooks onto the bus's current topics.
    async fn resubscribe(&mut self) -> AppResult<()> {
        let next = Hooks::subscribe(&self.registry).await?;
        let previous = std::mem::replace(&mut self.hooks, next);
        previous.release().await;
        info!(
            subscriptions = self.hooks.subscriptions.len(),
            "event hooks resubscribed"
        );
        Ok(())
    }

    /// Drain the listener, then release plugin resources.
    async fn stop(mut self) {
        self.stop.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.server).await {
            Ok(Ok(Ok(()))) => debug!("listener drained"),
            Ok(Ok(Err(err))) => error!(error = %err, "listener failed while draining"),
            Ok(Err(err)) => error!(error = %err, "listener task failed"),
            Err(_) => {
                warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "graceful shutdown timed out");
                self.server.abort();
            }
        }
        self.release().await;
    }

    async fn release(self) {
        self.hooks.release().await;
        let failures = self.registry.close_all().await;
        if !failures.is_empty() {
            warn!(failures = failures.len(), "some plugins failed to close");
        }
    }
}

fn spawn_stats_sampler(services: &Services, cancel: CancelToken) -> JoinHandle<()> {
    let bus = services.bus.clone();
    let metrics = services.metrics.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(stats) = bus.transport().queue_stats() {
                        metrics.record_pubsub(stats.queued, stats.subscribers, stats.dropped);
                    }
                }
            }
        }
    })
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C; shutting down"),
        () = terminate => info!("received SIGTERM; shutting down"),
    }
}
