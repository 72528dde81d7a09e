//! TUN device with background packet and event readers
//!
//! The packet reader moves parsed packets from the kernel into a bounded
//! outbound channel; ownership of each buffer transfers to the channel
//! consumer, which must return it to the pool. The event reader tracks
//! interface MTU and oper-state changes.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use tun::Device as _;

use crate::error::{VpnError, VpnResult};
use crate::packet::{PacketBuffer, PacketPool};
use crate::{INTERFACE_MTU, MAX_CONTENT_SIZE, OUTBOUND_CAP, TUN_HEADER_OFFSET};

/// How often the interface poller samples MTU and oper-state.
const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Interface state changes observed by the event reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    MtuUpdate(i64),
    Up,
    Down,
}

/// A kernel TUN interface bound to the overlay data-plane.
///
/// At most one packet reader and one event reader run at any time; both
/// terminate when [`TunDevice::close`] is called.
pub struct TunDevice {
    name: String,
    local_ip: Ipv4Addr,
    mtu: AtomicI64,
    pool: PacketPool,
    writer: Mutex<WriteHalf<tun::AsyncDevice>>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Box<PacketBuffer>>>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TunDevice {
    /// Open a TUN interface (or adopt `existing_tun`) and start the
    /// background readers.
    pub async fn new(
        existing_tun: Option<tun::AsyncDevice>,
        iface_name: &str,
        local_ip: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> VpnResult<Arc<Self>> {
        let device = match existing_tun {
            Some(device) => device,
            None => {
                let mut config = tun::Configuration::default();
                config
                    .name(iface_name)
                    .address(local_ip)
                    .netmask(netmask)
                    .mtu(INTERFACE_MTU as i32)
                    .up();

                #[cfg(target_os = "linux")]
                config.platform(|platform| {
                    platform.packet_information(false);
                });

                tun::create_as_async(&config).map_err(|e| VpnError::TunCreate(e.to_string()))?
            }
        };

        let name = device
            .get_ref()
            .name()
            .map_err(|e| VpnError::TunQueryName(e.to_string()))?;
        if name.is_empty() {
            return Err(VpnError::TunQueryName("device reported an empty name".into()));
        }
        let mtu = device
            .get_ref()
            .mtu()
            .map_err(|e| VpnError::TunQueryMtu(e.to_string()))?;

        info!("created TUN device {} with IP {}/{}", name, local_ip, netmask);

        let (reader, writer) = tokio::io::split(device);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAP);
        let (shutdown_tx, _) = watch::channel(false);

        let dev = Arc::new(Self {
            name,
            local_ip,
            mtu: AtomicI64::new(i64::from(mtu)),
            pool: PacketPool::new(),
            writer: Mutex::new(writer),
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });
        dev.spawn_packet_reader(reader, outbound_tx);
        dev.spawn_event_reader();

        Ok(dev)
    }

    /// The effective interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current interface MTU as last observed.
    pub fn mtu(&self) -> i64 {
        self.mtu.load(Ordering::SeqCst)
    }

    /// Check a clean buffer out of the pool.
    pub fn get_temp_packet(&self) -> Box<PacketBuffer> {
        self.pool.get()
    }

    /// Clear a buffer and return it to the pool.
    pub fn put_temp_packet(&self, buffer: Box<PacketBuffer>) {
        self.pool.put(buffer);
    }

    /// Free-list population, used by tests and diagnostics.
    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// The receive end of the outbound packet channel. Each received buffer
    /// is exclusively owned and must go back via [`Self::put_temp_packet`].
    pub fn outbound_chan(&self) -> Arc<Mutex<mpsc::Receiver<Box<PacketBuffer>>>> {
        Arc::clone(&self.outbound_rx)
    }

    /// Inject a peer packet into the host: rewrite the source address to
    /// `sender_ip` and the destination to the local overlay IP, regenerate
    /// checksums, write to the device.
    ///
    /// IPv6 packets are accepted and dropped: the local overlay address is
    /// IPv4-only for now.
    pub async fn write_packet(
        &self,
        data: &mut PacketBuffer,
        sender_ip: Ipv4Addr,
    ) -> VpnResult<()> {
        if data.is_ipv6() {
            debug!("ipv6 write path not implemented, dropping injected packet");
            return Ok(());
        }
        data.set_src(&sender_ip.octets());
        data.set_dst(&self.local_ip.octets());
        data.recalculate_checksum();

        let packet_len = data.packet().len();
        let mut writer = self.writer.lock().await;
        let written = writer
            .write(data.packet())
            .await
            .map_err(|e| VpnError::TunWrite(e.to_string()))?;
        if written < packet_len {
            warn!("wrote {} bytes, len(packet): {}", written, packet_len);
        }

        Ok(())
    }

    /// Stop both readers. Safe to call more than once; only the first call
    /// has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing TUN device: {}", self.name);
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_packet_reader(
        self: &Arc<Self>,
        mut reader: ReadHalf<tun::AsyncDevice>,
        outbound_tx: mpsc::Sender<Box<PacketBuffer>>,
    ) {
        let device = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!("tun packet reader started");
            let mut reuse: Option<Box<PacketBuffer>> = None;

            loop {
                let mut data = match reuse.take() {
                    Some(mut data) => {
                        data.clear();
                        data
                    }
                    None => device.get_temp_packet(),
                };

                let read = tokio::select! {
                    read = reader.read(&mut data.buffer_mut()[TUN_HEADER_OFFSET..]) => read,
                    _ = shutdown_rx.changed() => {
                        device.put_temp_packet(data);
                        break;
                    }
                };
                let size = match read {
                    Ok(0) => {
                        device.put_temp_packet(data);
                        break;
                    }
                    Ok(size) => size,
                    Err(e) => {
                        device.put_temp_packet(data);
                        if !device.closed.load(Ordering::SeqCst) {
                            error!("{}", VpnError::TunRead(e.to_string()));
                        }
                        break;
                    }
                };
                if size > MAX_CONTENT_SIZE {
                    reuse = Some(data);
                    continue;
                }

                data.set_len(size);
                if !data.parse() {
                    reuse = Some(data);
                    continue;
                }

                // Ownership of the buffer transfers to the consumer here. A
                // full channel blocks the reader, which in turn backs the
                // kernel queue up.
                let sent = tokio::select! {
                    sent = outbound_tx.send(data) => sent.is_ok(),
                    _ = shutdown_rx.changed() => false,
                };
                if !sent {
                    break;
                }
            }

            debug!("tun packet reader stopped");
        });
    }

    fn spawn_event_reader(self: &Arc<Self>) {
        let (events_tx, mut events_rx) = mpsc::channel::<TunEvent>(8);
        self.spawn_interface_poller(events_tx);

        let device = Arc::clone(self);
        tokio::spawn(async move {
            // Terminates when the poller drops its sender on shutdown.
            while let Some(event) = events_rx.recv().await {
                match event {
                    TunEvent::MtuUpdate(mtu) => device.apply_mtu_update(mtu),
                    TunEvent::Up => debug!("interface up requested"),
                    TunEvent::Down => info!("interface down requested"),
                }
            }
            debug!("tun event reader stopped");
        });
    }

    fn spawn_interface_poller(self: &Arc<Self>, events_tx: mpsc::Sender<TunEvent>) {
        let device = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVENT_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_mtu: Option<i64> = None;
            let mut last_up: Option<bool> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                if let Some(mtu) = read_interface_mtu(&device.name).await {
                    if last_mtu != Some(mtu) {
                        last_mtu = Some(mtu);
                        if events_tx.send(TunEvent::MtuUpdate(mtu)).await.is_err() {
                            break;
                        }
                    }
                }
                if let Some(up) = read_interface_up(&device.name).await {
                    let changed = last_up.is_some() && last_up != Some(up);
                    last_up = Some(up);
                    if changed {
                        let event = if up { TunEvent::Up } else { TunEvent::Down };
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn apply_mtu_update(&self, mtu: i64) {
        if mtu < 0 {
            error!("MTU not updated to negative value: {}", mtu);
            return;
        }
        let (mtu, too_large) = cap_mtu(mtu);
        let old = self.mtu.swap(mtu, Ordering::SeqCst);
        if old != mtu {
            info!("MTU updated: {}{}", mtu, too_large);
        }
    }
}

/// Cap an observed MTU at the backing buffer size.
fn cap_mtu(mtu: i64) -> (i64, String) {
    if mtu > MAX_CONTENT_SIZE as i64 {
        (
            MAX_CONTENT_SIZE as i64,
            format!(" (too large, capped at {})", MAX_CONTENT_SIZE),
        )
    } else {
        (mtu, String::new())
    }
}

#[cfg(target_os = "linux")]
async fn read_interface_mtu(name: &str) -> Option<i64> {
    let raw = tokio::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .await
        .ok()?;
    raw.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
async fn read_interface_mtu(_name: &str) -> Option<i64> {
    None
}

#[cfg(target_os = "linux")]
async fn read_interface_up(name: &str) -> Option<bool> {
    let raw = tokio::fs::read_to_string(format!("/sys/class/net/{name}/operstate"))
        .await
        .ok()?;
    Some(raw.trim() != "down")
}

#[cfg(not(target_os = "linux"))]
async fn read_interface_up(_name: &str) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_cap() {
        assert_eq!(cap_mtu(1500), (1500, String::new()));
        assert_eq!(cap_mtu(MAX_CONTENT_SIZE as i64), (MAX_CONTENT_SIZE as i64, String::new()));

        let (capped, note) = cap_mtu(MAX_CONTENT_SIZE as i64 + 1);
        assert_eq!(capped, MAX_CONTENT_SIZE as i64);
        assert!(note.contains("too large"));
        assert!(note.contains(&MAX_CONTENT_SIZE.to_string()));
    }
}
