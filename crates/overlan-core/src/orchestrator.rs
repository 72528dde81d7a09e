//! Lifecycle orchestration
//!
//! Wires identity, overlay host, bootstrap, TUN device and tunnel together
//! and tears them down in reverse order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use overlan_p2p::{
    identity, Bootstrapper, HostConfig, OverlayHost, RelayTuning,
};
use overlan_vpn::TunDevice;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::tunnel::Tunnel;

/// The assembled overlan node.
pub struct Application {
    config_path: PathBuf,
    config: Config,
    host: Option<OverlayHost>,
    tun: Option<Arc<TunDevice>>,
    tunnel: Option<Arc<Tunnel>>,
    maintenance: Option<JoinHandle<()>>,
}

impl Application {
    pub fn new(config_path: PathBuf, config: Config) -> Self {
        Self {
            config_path,
            config,
            host: None,
            tun: None,
            tunnel: None,
            maintenance: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> Option<&OverlayHost> {
        self.host.as_ref()
    }

    /// Bring the node up: identity, overlay host, bootstrap, TUN device,
    /// tunnel, reconnection maintenance. Any failure aborts the sequence.
    pub async fn init(&mut self) -> CoreResult<()> {
        let secret = self
            .config
            .private_key_bytes()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let host_identity = identity::load_or_generate(secret.as_deref())?;

        // Persist the chosen key and the derived peer id.
        let secret = identity::secret_bytes(&host_identity.keypair)?;
        self.config.set_identity(&secret, &host_identity.peer_id);
        if let Err(e) = self.config.save(&self.config_path).await {
            warn!("failed to save config with identity: {:#}", e);
        }

        let listen_addrs = self
            .config
            .listen_multiaddrs()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let host_config = HostConfig {
            listen_addrs,
            user_agent: self.config.p2p.user_agent.clone(),
            conn_manager: Default::default(),
            relay: RelayTuning::default(),
        };
        let host = OverlayHost::init(host_identity.keypair, host_config).await?;
        info!("host created, we are: {}", host.local_peer_id());
        info!("listen addresses: {:?}", host.announced_as().await);

        let bootstrapper = Bootstrapper::new(host.clone(), self.config.bootstrap_multiaddrs());
        bootstrapper.bootstrap().await?;

        let tun = TunDevice::new(
            None,
            &self.config.vpn.interface_name,
            self.config.vpn.local_address,
            self.config.vpn.netmask,
        )
        .await?;
        info!("interface {} is up, mtu {}", tun.name(), tun.mtu());

        let tunnel = Tunnel::start(host.clone(), Arc::clone(&tun))?;
        tunnel.set_peers(self.config.known_peers()).await;

        self.maintenance = Some(self.spawn_maintenance(host.clone()));
        self.host = Some(host);
        self.tun = Some(tun);
        self.tunnel = Some(tunnel);

        Ok(())
    }

    /// Periodically reconnects to known peers that dropped off. Backoff in
    /// the host keeps failing peers cheap.
    fn spawn_maintenance(&self, host: OverlayHost) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.p2p.reconnection_interval_secs.max(1));
        let known_peers = self.config.known_peers();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for (peer_id, _) in &known_peers {
                    let peer_id = *peer_id;
                    if host.is_connected(peer_id).await {
                        continue;
                    }
                    match host.find_peer(peer_id).await {
                        Ok(info) => {
                            if let Err(e) = host.connect_peer(info).await {
                                debug!("reconnect to {}: {}", peer_id, e);
                            }
                        }
                        Err(e) => debug!("lookup of {}: {}", peer_id, e),
                    }
                }
            }
        })
    }

    /// Tear the node down: tunnel, TUN device, overlay host, config.
    pub async fn close(&mut self) {
        if let Some(task) = self.maintenance.take() {
            task.abort();
        }
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close();
        }
        if let Some(tun) = self.tun.take() {
            tun.close();
        }
        if let Some(host) = self.host.take() {
            if let Err(e) = host.close().await {
                error!("closing overlay host: {}", e);
            }
        }
        if let Err(e) = self.config.save(&self.config_path).await {
            warn!("failed to save config on shutdown: {:#}", e);
        }
        info!("overlan stopped");
    }
}
