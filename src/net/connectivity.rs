//! Wireless association lifecycle.
//!
//! The manager cycles `Disconnected -> Connecting -> Connected` and back,
//! backing off exponentially between failed associations. The current state
//! is published on a watch channel; readers hold a [`ConnectivityHandle`].

use crate::config::WifiConfig;
use crate::error::{AgentError, Result};
use crate::net::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, warn};

/// Link state as seen by the rest of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

/// Radio driver capability.
#[async_trait]
pub trait WirelessLink: Send {
    /// Join the configured network.
    async fn associate(&mut self, wifi: &WifiConfig) -> Result<()>;

    /// Whether the link is still up.
    async fn is_associated(&mut self) -> bool;
}

/// Read-only view of the connectivity state.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    rx: watch::Receiver<ConnectivityState>,
}

impl ConnectivityHandle {
    pub fn new(rx: watch::Receiver<ConnectivityState>) -> Self {
        Self { rx }
    }

    /// Current state.
    pub fn state(&self) -> ConnectivityState {
        *self.rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectivityState::Connected
    }

    /// Resolve on the next state change, not yet seen through this handle,
    /// that leaves the link `Connected`.
    ///
    /// Never resolves once the manager is gone.
    pub async fn connected(&mut self) {
        loop {
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
            if *self.rx.borrow_and_update() == ConnectivityState::Connected {
                return;
            }
        }
    }

    /// Resolve as soon as the link is not `Connected`.
    ///
    /// Never resolves while the link stays up or once the manager is gone.
    pub async fn lost(&mut self) {
        loop {
            if *self.rx.borrow_and_update() != ConnectivityState::Connected {
                return;
            }
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Owns the wireless link and drives its state machine.
pub struct ConnectivityManager {
    link: Box<dyn WirelessLink>,
    wifi: WifiConfig,
    backoff: RetryPolicy,
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityManager {
    /// Create a manager and the handle observing it. Starts `Disconnected`.
    pub fn new(link: Box<dyn WirelessLink>, wifi: WifiConfig) -> (Self, ConnectivityHandle) {
        let (tx, rx) = watch::channel(ConnectivityState::Disconnected);
        let backoff = RetryPolicy::for_association(&wifi);
        (
            Self {
                link,
                wifi,
                backoff,
                tx,
            },
            ConnectivityHandle::new(rx),
        )
    }

    /// Another handle on the same state.
    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle::new(self.tx.subscribe())
    }

    /// Keep the link up until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut failures: u32 = 0;

        while !shutdown.is_triggered() {
            self.transition(ConnectivityState::Connecting);

            let outcome = tokio::select! {
                outcome = time::timeout(
                    self.wifi.association_timeout(),
                    self.link.associate(&self.wifi),
                ) => outcome,
                _ = shutdown.wait() => break,
            };

            match outcome {
                Ok(Ok(())) => {
                    failures = 0;
                    self.transition(ConnectivityState::Connected);
                    if !self.supervise(&mut shutdown).await {
                        break;
                    }
                    warn!("Wireless link to {} lost", self.wifi.ssid);
                    self.transition(ConnectivityState::Disconnected);
                }
                Ok(Err(e)) => {
                    failures = failures.saturating_add(1);
                    self.transition(ConnectivityState::Disconnected);
                    if !self.back_off(failures, &e, &mut shutdown).await {
                        break;
                    }
                }
                Err(_) => {
                    failures = failures.saturating_add(1);
                    self.transition(ConnectivityState::Disconnected);
                    let e = AgentError::association_error(format!(
                        "no association within {:?}",
                        self.wifi.association_timeout()
                    ));
                    if !self.back_off(failures, &e, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.transition(ConnectivityState::Disconnected);
    }

    /// Poll the link while it is up. Returns `false` on shutdown.
    async fn supervise(&mut self, shutdown: &mut Shutdown) -> bool {
        loop {
            tokio::select! {
                _ = time::sleep(self.wifi.link_check_interval()) => {}
                _ = shutdown.wait() => return false,
            }

            let up = time::timeout(self.wifi.association_timeout(), self.link.is_associated())
                .await
                .unwrap_or(false);
            if !up {
                return true;
            }
        }
    }

    /// Wait before the next association. Returns `false` on shutdown.
    async fn back_off(
        &mut self,
        failures: u32,
        error: &AgentError,
        shutdown: &mut Shutdown,
    ) -> bool {
        let delay = self.backoff.delay_for(failures);
        warn!(
            attempt = failures,
            "Association with {} failed, retrying in {:?}: {}", self.wifi.ssid, delay, error
        );
        tokio::select! {
            _ = time::sleep(delay) => true,
            _ = shutdown.wait() => false,
        }
    }

    fn transition(&self, next: ConnectivityState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Connectivity changed");
        }
    }
}

/// Link managed by the host OS, as on Raspberry Pi OS.
///
/// Link state comes from `/sys/class/net/<iface>/operstate`. When the
/// interface is down, association is requested through NetworkManager.
#[derive(Debug, Clone)]
pub struct HostLink {
    interface: String,
    sysfs_root: PathBuf,
}

impl HostLink {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            sysfs_root: PathBuf::from("/sys"),
        }
    }

    /// Read link state below another sysfs mount point.
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    async fn operstate_up(&self) -> bool {
        let path = self
            .sysfs_root
            .join("class/net")
            .join(&self.interface)
            .join("operstate");
        tokio::fs::read_to_string(path)
            .await
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    }
}

#[async_trait]
impl WirelessLink for HostLink {
    async fn associate(&mut self, wifi: &WifiConfig) -> Result<()> {
        if self.operstate_up().await {
            return Ok(());
        }

        let output = tokio::process::Command::new("nmcli")
            .args(["device", "wifi", "connect", &wifi.ssid, "password"])
            .arg(&wifi.passphrase)
            .args(["ifname", &self.interface])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AgentError::association_error(format!("Failed to run nmcli: {}", e)))?;

        if !output.status.success() {
            return Err(AgentError::association_error(format!(
                "nmcli exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if self.operstate_up().await {
            Ok(())
        } else {
            Err(AgentError::association_error(format!(
                "{} still down after association",
                self.interface
            )))
        }
    }

    async fn is_associated(&mut self) -> bool {
        self.operstate_up().await
    }
}

/// Link with a fixed state, for simulations and hosts on wired networks.
#[derive(Debug, Clone, Copy)]
pub struct StaticLink {
    up: bool,
}

impl StaticLink {
    pub fn up() -> Self {
        Self { up: true }
    }

    pub fn down() -> Self {
        Self { up: false }
    }
}

#[async_trait]
impl WirelessLink for StaticLink {
    async fn associate(&mut self, _wifi: &WifiConfig) -> Result<()> {
        if self.up {
            Ok(())
        } else {
            Err(AgentError::association_error("link administratively down"))
        }
    }

    async fn is_associated(&mut self) -> bool {
        self.up
    }
}
