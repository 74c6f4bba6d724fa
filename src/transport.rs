use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use async_std::net::UdpSocket;

use log::{debug, trace};

use crate::{
    codec,
    config::ClientConfig,
    error::{Result, TransportError, TransportErrorKind},
};

const MAX_DATAGRAM_LEN: usize = 1500;

/// The datagram channel to a device.
///
/// All controllers listen for UDPv4 broadcast probes on port 5570. If such a
/// probe is received, the device sends a unicast reply back to the sender
/// identifying itself by its device id.
///
/// The `Transport` allows to send such probes, collect the replies and
/// afterwards exchange datagrams with one selected device, either one of
/// the discovered ones or a manually given address.
///
/// The UDP socket is owned by the `Transport` and the `Link`s handed out
/// by it. It is released once all of them are dropped.
#[derive(Debug)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    relay_addr: Option<SocketAddr>,
    rounds: u8,
    discovered: BTreeMap<String, SocketAddr>,
    remote: Option<SocketAddr>,
}

impl Transport {
    /// Bind a new socket according to `config`.
    pub async fn bind(config: &ClientConfig) -> Result<Transport> {
        let socket = UdpSocket::bind(config.local_addr)
            .await
            .map_err(|err| TransportError::io(TransportErrorKind::Bind, &err))?;
        socket
            .set_broadcast(true)
            .map_err(|err| TransportError::io(TransportErrorKind::Bind, &err))?;

        if let Ok(addr) = socket.local_addr() {
            debug!("Bound UDP socket to {}", addr);
        }

        Ok(Transport {
            socket: Arc::new(socket),
            broadcast_addr: config.broadcast_addr,
            relay_addr: config.relay_addr,
            rounds: config.discovery_rounds.max(1),
            discovered: BTreeMap::new(),
            remote: None,
        })
    }

    /// Set the broadcast address.
    pub fn set_broadcast_addr(&mut self, addr: SocketAddr) {
        self.broadcast_addr = addr;
    }

    /// Set the relay address that receives a copy of each probe.
    pub fn set_relay_addr(&mut self, addr: Option<SocketAddr>) {
        self.relay_addr = addr;
    }

    /// Set the number of discovery rounds.
    pub fn set_rounds(&mut self, rounds: u8) {
        self.rounds = rounds.max(1);
    }

    /// The local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|err| TransportError::io(TransportErrorKind::Bind, &err).into())
    }

    /// Discover devices and return all results collected so far.
    ///
    /// Each round sends a probe and waits `round_timeout` for replies. If
    /// `clear` is set, results of previous discoveries are discarded first,
    /// otherwise a device seen again simply replaces its previous entry.
    pub async fn discover(
        &mut self,
        round_timeout: Duration,
        clear: bool,
    ) -> Result<&BTreeMap<String, SocketAddr>> {
        if clear {
            self.discovered.clear();
        }

        let probe = codec::encode_discovery_probe();

        for round in 0..self.rounds {
            trace!("Sending discovery probe {} to {}", round, self.broadcast_addr);
            self.send_to(&probe, self.broadcast_addr).await?;
            if let Some(relay_addr) = self.relay_addr {
                self.send_to(&probe, relay_addr).await?;
            }

            let socket = &self.socket;
            let discovered = &mut self.discovered;

            let future = async_std::io::timeout::<_, ()>(round_timeout, async {
                let mut buf = [0u8; MAX_DATAGRAM_LEN];
                loop {
                    let (len, address) = socket.recv_from(&mut buf).await?;
                    match codec::decode_discovery_response(&buf[0..len], address) {
                        Ok(device) => {
                            debug!("Discovered {} at {}", device.device_id, device.address);
                            discovered.insert(device.device_id, device.address);
                        }
                        Err(err) => {
                            trace!("Ignoring datagram from {}: {}", address, err);
                        }
                    }
                }
            });

            drop(future.await);
        }

        Ok(&self.discovered)
    }

    /// The results of all discoveries since the last clear.
    pub fn discovered(&self) -> &BTreeMap<String, SocketAddr> {
        &self.discovered
    }

    /// Select a manually given remote endpoint.
    pub fn bind_manual(&mut self, addr: SocketAddr) {
        self.remote = Some(addr);
    }

    /// Select the remote endpoint of a discovered device.
    pub fn bind_discovered(&mut self, device_id: &str) -> Result<SocketAddr> {
        match self.discovered.get(device_id) {
            Some(addr) => {
                self.remote = Some(*addr);
                Ok(*addr)
            }
            None => Err(TransportError::new(
                TransportErrorKind::UnknownDevice,
                format!("{} has not been discovered", device_id),
            )
            .into()),
        }
    }

    /// The selected remote endpoint.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// A handle to exchange datagrams with the selected remote endpoint.
    pub fn link(&self) -> Result<Link> {
        match self.remote {
            Some(remote) => Ok(Link {
                socket: self.socket.clone(),
                remote,
            }),
            None => Err(TransportError::new(
                TransportErrorKind::NoEndpoint,
                "no remote endpoint selected",
            )
            .into()),
        }
    }

    /// Send a datagram to the selected remote endpoint.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.link()?.send(bytes).await
    }

    /// Receive a datagram from the selected remote endpoint.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.link()?.receive(timeout).await
    }

    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket
            .send_to(bytes, addr)
            .await
            .map_err(|err| TransportError::io(TransportErrorKind::Send, &err))?;
        Ok(())
    }
}

/// A datagram channel bound to one remote endpoint.
#[derive(Debug, Clone)]
pub struct Link {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl Link {
    /// The remote endpoint.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Send a datagram to the remote endpoint.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.socket
            .send_to(bytes, self.remote)
            .await
            .map_err(|err| TransportError::io(TransportErrorKind::Send, &err))?;
        Ok(())
    }

    /// Wait up to `timeout` for a datagram from the remote endpoint.
    ///
    /// Returns `None` if nothing arrived in time. Datagrams from other
    /// senders are discarded.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let result = async_std::io::timeout(timeout, async {
            let mut buf = [0u8; MAX_DATAGRAM_LEN];
            loop {
                let (len, address) = self.socket.recv_from(&mut buf).await?;
                if address == self.remote {
                    break Ok(buf[0..len].to_vec());
                }

                trace!("Ignoring datagram from {}", address);
            }
        })
        .await;

        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(err) => Err(TransportError::io(TransportErrorKind::Receive, &err).into()),
        }
    }
}
