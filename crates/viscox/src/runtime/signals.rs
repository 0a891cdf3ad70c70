use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use viscox_core::engine::RigEngine;

/// Shutdown request shared between the signal listener and the thread that
/// created it, which is the one woken on request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    waiter: Thread,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            waiter: thread::current(),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.waiter.unpark();
    }

    /// Parks the creating thread until shutdown is requested or `limit` has
    /// elapsed. Returns whether shutdown was requested.
    pub fn wait(&self, limit: Option<Duration>) -> bool {
        let deadline = limit.and_then(|limit| Instant::now().checked_add(limit));
        while !self.is_requested() {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
        true
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers the SIGINT/SIGTERM handlers before returning, then waits for the
/// first signal on a dedicated thread. A signal stops any running ramp and
/// requests shutdown.
pub fn install_signal_handlers(engine: Arc<RigEngine>, shutdown: ShutdownSignal) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let listener = {
        let _guard = runtime.enter();
        Listener::register()?
    };

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let signal = runtime.block_on(listener.recv());
            warn!(signal, "Shutdown requested");
            if engine.stop_ramp() {
                info!("Stopping active ramp");
            }
            shutdown.request();
        })?;
    Ok(())
}

#[cfg(unix)]
struct Listener {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Listener {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct Listener;

#[cfg(not(unix))]
impl Listener {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}
