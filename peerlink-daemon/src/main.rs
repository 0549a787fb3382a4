mod config;
mod diagnostics;
mod plugins;
mod trust_store;

use anyhow::{Context, Result};
use peerlink_protocol::{CertificateInfo, DeviceEvent, DeviceRegistry, PluginRegistry, TrustStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{error, info, warn};

use config::Config;
use diagnostics::{Cli, Command};
use plugins::{NotificationPluginFactory, PingPluginFactory};
use trust_store::FileTrustStore;

/// Main daemon state
struct Daemon {
    config: Config,
    registry: DeviceRegistry,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Daemon {
    fn new(
        config: Config,
        certificate: CertificateInfo,
        trust: Arc<FileTrustStore>,
        discovering: bool,
    ) -> Result<Self> {
        let plugins = Self::initialize_plugins(&config)?;

        let mut registry_config = config.registry_config();
        registry_config.discovering = discovering;

        let registry = DeviceRegistry::new(certificate, registry_config, plugins, trust)
            .context("Failed to create device registry")?;
        let events = registry.subscribe();

        Ok(Self {
            config,
            registry,
            events,
        })
    }

    fn initialize_plugins(config: &Config) -> Result<PluginRegistry> {
        let mut plugins = PluginRegistry::new();

        if config.plugins.enable_ping {
            plugins
                .register_factory(Arc::new(PingPluginFactory))
                .context("Failed to register ping plugin")?;
        }
        if config.plugins.enable_notification {
            plugins
                .register_factory(Arc::new(NotificationPluginFactory))
                .context("Failed to register notification plugin")?;
        }

        info!("Registered plugins: {:?}", plugins.plugin_names());
        Ok(plugins)
    }

    async fn run(&mut self) -> Result<()> {
        self.registry
            .start()
            .await
            .context("Failed to start device registry")?;

        info!(
            "Daemon running as {} ({}), fingerprint {}",
            self.config.device.name,
            self.registry.device_id(),
            self.registry.fingerprint()
        );

        let period = self
            .config
            .discovery_interval()
            .unwrap_or(Duration::from_secs(u64::from(u32::MAX)));
        let mut announce = interval_at(Instant::now() + period, period);
        let periodic = self.config.discovery_interval().is_some();

        let mut hangup = signal(SignalKind::hangup()).context("Failed to watch SIGHUP")?;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = hangup.recv() => {
                    info!("Network change signalled, announcing again");
                    if let Err(e) = self.registry.network_changed(true).await {
                        warn!("Failed to announce after network change: {}", e);
                    }
                }
                _ = announce.tick(), if periodic => {
                    if self.registry.is_discovering() {
                        if let Err(e) = self.registry.broadcast_local_identity().await {
                            warn!("Periodic announcement failed: {}", e);
                        }
                    }
                }
                Some(event) = self.events.recv() => self.handle_event(event).await,
            }
        }

        Ok(())
    }

    async fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::DeviceListChanged { device_ids } => {
                info!("Devices: {:?}", device_ids);
            }
            DeviceEvent::StateChanged { device_id, state } => {
                info!("{} is now {}", device_id, state);
            }
            DeviceEvent::PairingRequested {
                device_id,
                device_name,
                fingerprint,
            } => {
                info!(
                    "Pairing requested by {} ({}), fingerprint {}",
                    device_name, device_id, fingerprint
                );
                if self.config.pairing.auto_accept {
                    match self.registry.accept_pairing(&device_id).await {
                        Ok(()) => info!("Accepted pairing with {}", device_id),
                        Err(e) if e.is_user_visible() => error!(
                            "Failed to accept pairing with {}: {}",
                            device_id,
                            e.user_message()
                        ),
                        Err(e) => warn!("Failed to accept pairing with {}: {}", device_id, e),
                    }
                }
            }
            DeviceEvent::Paired {
                device_id,
                fingerprint,
            } => info!("Paired with {}, pinned {}", device_id, fingerprint),
            DeviceEvent::PairingRejected { device_id, reason } => {
                info!("Pairing with {} rejected: {}", device_id, reason)
            }
            DeviceEvent::PairingTimeout { device_id } => {
                info!("Pairing with {} timed out", device_id)
            }
            DeviceEvent::Unpaired { device_id } => info!("Unpaired from {}", device_id),
            DeviceEvent::TrustViolation {
                device_id,
                expected,
                actual,
            } => warn!(
                "Refused {}: expected fingerprint {}, presented {}",
                device_id, expected, actual
            ),
            DeviceEvent::ConnectionFailed {
                device_id,
                remote_addr,
                message,
            } => warn!(
                "Connection to {} at {} failed: {}",
                device_id.as_deref().unwrap_or("unknown device"),
                remote_addr,
                message
            ),
            DeviceEvent::ConnectionLost {
                device_id, reason, ..
            } => info!("Lost connection to {}: {}", device_id, reason),
        }
    }

    async fn shutdown(self) {
        info!("Shutting down daemon");
        self.registry.shutdown().await;
        info!("Daemon shutdown complete");
    }
}

fn load_certificate(config: &Config) -> Result<CertificateInfo> {
    CertificateInfo::load_from_files(&config.paths.certificate, &config.paths.private_key)
        .with_context(|| {
            format!(
                "Failed to load certificate {} and key {}; generate a self-signed pair whose CN is this host's device id",
                config.paths.certificate.display(),
                config.paths.private_key.display()
            )
        })
}

fn open_trust_store(config: &Config) -> Result<Arc<FileTrustStore>> {
    let trust = FileTrustStore::open(&config.paths.trust_store).with_context(|| {
        format!(
            "Failed to open trust store {}",
            config.paths.trust_store.display()
        )
    })?;
    Ok(Arc::new(trust))
}

fn print_fingerprint(config: &Config) -> Result<()> {
    let certificate = load_certificate(config)?;
    println!("Device ID:   {}", certificate.device_id);
    println!("Fingerprint: {}", certificate.fingerprint);
    Ok(())
}

fn print_devices(config: &Config) -> Result<()> {
    let trust = open_trust_store(config)?;
    let known = trust.known_devices().context("Failed to read known devices")?;

    if known.is_empty() {
        println!("No known devices");
        return Ok(());
    }

    for device_id in known {
        match trust.fingerprint(&device_id)? {
            Some(fingerprint) => println!("{}  paired  {}", device_id, fingerprint),
            None => println!("{}  unpaired", device_id),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    if cli.auto_accept {
        config.pairing.auto_accept = true;
    }

    match cli.command {
        Some(Command::Fingerprint) => return print_fingerprint(&config),
        Some(Command::Devices) => return print_devices(&config),
        None => {}
    }

    config
        .ensure_directories()
        .context("Failed to create directories")?;

    let certificate = load_certificate(&config)?;
    let trust = open_trust_store(&config)?;

    let mut daemon = Daemon::new(config, certificate, trust, !cli.no_discovery)?;
    let result = daemon.run().await;
    if let Err(e) = &result {
        error!("Daemon error: {:#}", e);
    }
    daemon.shutdown().await;

    result
}
