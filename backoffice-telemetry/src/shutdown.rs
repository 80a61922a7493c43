//! Deterministic shutdown of the telemetry components.
//!
//! Components are drained in registration order (producers first, then the
//! pipelines they feed) under a single overall deadline. Every component gets
//! a [`TelemetryContext`] whose deadline is what remains of that budget.
//!
//! # Example
//!
//! ```no_run
//! use backoffice_telemetry::shutdown::{ShutdownCoordinator, ShutdownSignal};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let signal = ShutdownSignal::new();
//! let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
//!
//! signal.wait().await;
//! let _ = coordinator.shutdown().await;
//! # }
//! ```

use crate::context::TelemetryContext;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};

/// Shutdown signal handler
#[derive(Clone)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Waits for SIGINT or SIGTERM. A handler that cannot be installed is
    /// logged and never fires.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        info!("Manually triggering shutdown");
        self.triggered.store(true, Ordering::SeqCst);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A component that drains and closes on shutdown.
#[async_trait]
pub trait GracefulShutdown: Send + Sync {
    fn name(&self) -> &str;

    /// Drains the component. Implementations honour the deadline and
    /// cancellation of `ctx`.
    async fn shutdown(&self, ctx: &TelemetryContext) -> Result<(), ShutdownError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShutdownError {
    #[error("Shutdown timed out after {0:?}")]
    Timeout(Duration),

    #[error("Component {component} shutdown failed: {reason}")]
    ComponentFailed { component: String, reason: String },

    #[error("Shutdown already in progress")]
    AlreadyShuttingDown,
}

/// Shutdown hook function type
type ShutdownHook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Runs shutdown hooks, then every registered component, in order.
pub struct ShutdownCoordinator {
    timeout: Duration,
    hooks: Mutex<Vec<ShutdownHook>>,
    components: Mutex<Vec<Arc<dyn GracefulShutdown>>>,
    is_shutting_down: AtomicBool,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("timeout", &self.timeout)
            .field("is_shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            hooks: Mutex::new(Vec::new()),
            components: Mutex::new(Vec::new()),
            is_shutting_down: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a hook. Hooks run before any component, in registration
    /// order.
    pub fn on_shutdown<F, Fut>(&self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: ShutdownHook = Box::new(move || Box::pin(f()));
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn register_component(&self, component: Arc<dyn GracefulShutdown>) {
        self.components
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(component);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown_with(&TelemetryContext::new()).await
    }

    /// Shuts down within the earlier of the coordinator timeout and the
    /// deadline of `ctx`. Returns the first component failure, after all
    /// components have been attempted.
    pub async fn shutdown_with(&self, ctx: &TelemetryContext) -> Result<(), ShutdownError> {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        info!("Starting graceful shutdown");
        let ctx = ctx.with_timeout(self.timeout);
        let budget = ctx.remaining().unwrap_or(self.timeout);

        self.execute_hooks().await;
        let result = self.shutdown_components(&ctx, budget).await;

        info!("Graceful shutdown completed");
        result
    }

    async fn execute_hooks(&self) {
        let hooks: Vec<_> = {
            let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            hooks.iter().map(|hook| hook()).collect()
        };
        debug!("Executing {} shutdown hooks", hooks.len());
        for hook in hooks {
            hook.await;
        }
    }

    async fn shutdown_components(
        &self,
        ctx: &TelemetryContext,
        budget: Duration,
    ) -> Result<(), ShutdownError> {
        let components = self
            .components
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        info!("Shutting down {} components", components.len());

        let mut first_error = None;
        for component in components {
            let name = component.name().to_string();
            debug!("Shutting down component: {}", name);

            let outcome = tokio::select! {
                out = component.shutdown(ctx) => Some(out),
                _ = ctx.cancelled() => None,
            };
            let error = match outcome {
                Some(Ok(())) => {
                    info!("Component {} shut down successfully", name);
                    continue;
                }
                Some(Err(e)) => {
                    warn!("Component {} shutdown failed: {}", name, e);
                    e
                }
                None => {
                    warn!("Component {} shutdown timed out", name);
                    ShutdownError::Timeout(budget)
                }
            };
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
