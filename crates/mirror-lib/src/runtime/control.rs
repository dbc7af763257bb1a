//! Shutdown and reload requests shared between signal handlers and the scheduler

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::info;

/// Cloneable handle carrying shutdown and reload requests
#[derive(Clone)]
pub struct Control {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Polled by the reconciler between kinds
    shutting_down: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            shutting_down: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Flag the reconciler checks between kinds
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.shutting_down.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown requested");
        let _ = self.shutdown_tx.send(true);
        self.wake.notify_one();
    }

    /// Ask for a reload at the next idle point
    pub fn request_reload(&self) {
        info!("Reload requested");
        self.reload.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Consume a pending reload request
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Resolves when a shutdown or reload request arrives
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    /// Translate process signals into requests until shutdown.
    /// SIGHUP reloads; SIGINT and SIGTERM shut down.
    #[cfg(unix)]
    pub async fn listen_for_signals(&self) -> std::io::Result<&'static str> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("Received SIGHUP");
                    self.request_reload();
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    self.shutdown();
                    return Ok("SIGINT received");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    self.shutdown();
                    return Ok("SIGTERM received");
                }
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn listen_for_signals(&self) -> std::io::Result<&'static str> {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        self.shutdown();
        Ok("Ctrl+C received")
    }
}
