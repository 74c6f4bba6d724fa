use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_std::{
    channel::{self, Receiver, Sender, TrySendError},
    task::{self, JoinHandle},
};

use log::{debug, info, trace, warn};

use parking_lot::Mutex;

use rand::Rng;

use crate::{
    codec::{self, SETPOINT_STATE_REQUEST_CODE},
    config::ClientConfig,
    error::{Error, Result, TransportError, TransportErrorKind},
    keys::{DatapointKey, Key, SetpointKey, SetpointRange},
    session::{self, ConnectionStatus, Phase, Session, SessionEvent, SetpointState, Target},
    transport::{Link, Transport},
};

/// The client side of a session with one controller.
///
/// A `DeviceClient` discovers devices, selects one of them (or a manually
/// given address), connects to it and keeps the reported values current
/// while connected. Setpoints can be written with readback verification.
///
/// After `connect` a background task receives and decodes all inbound
/// datagrams, so values keep updating while the caller is suspended in one
/// of the waits.
#[derive(Debug)]
pub struct DeviceClient {
    email: String,
    config: ClientConfig,
    session: Arc<Mutex<Session>>,
    transport: Option<Transport>,
    link: Option<Link>,
    events: Option<Receiver<SessionEvent>>,
    receive_loop: Option<JoinHandle<()>>,
}

impl DeviceClient {
    /// Create a new `DeviceClient` identifying itself with `email`.
    ///
    /// No socket is bound until the first operation that needs one.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> async_nilan_nabto::Result<()> { async_std::task::block_on(async {
    /// #
    /// use std::time::Duration;
    ///
    /// use async_nilan_nabto::{ClientConfig, DeviceClient, DatapointKey};
    ///
    /// let mut client = DeviceClient::new("me@example.com", ClientConfig::default());
    /// client.discover(true).await?;
    /// client.select_first_discovered().await?;
    /// client.connect().await?;
    /// client.wait_for_connection(Duration::from_secs(5)).await?;
    ///
    /// if client.wait_for_data(Duration::from_secs(10)).await {
    ///     println!("{:?}", client.get_value(DatapointKey::TempSupply));
    /// }
    ///
    /// client.close().await;
    /// #
    /// # Ok(()) }) }
    /// ```
    pub fn new<S: Into<String>>(email: S, config: ClientConfig) -> DeviceClient {
        let client_id = rand::thread_rng().gen_range(1..=u32::MAX);

        DeviceClient {
            email: email.into(),
            config,
            session: Arc::new(Mutex::new(Session::new(client_id))),
            transport: None,
            link: None,
            events: None,
            receive_loop: None,
        }
    }

    /// The identity sent in the connect request.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// The tunables of this client.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn transport(&mut self) -> Result<&mut Transport> {
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => Transport::bind(&self.config).await?,
        };
        Ok(self.transport.get_or_insert(transport))
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.session.lock().fail(err.code());
        }
        result
    }

    /// Run one discovery and return all devices discovered so far.
    ///
    /// If `clear` is set, results of previous discoveries are discarded.
    pub async fn discover(&mut self, clear: bool) -> Result<BTreeMap<String, SocketAddr>> {
        self.session.lock().begin_discovery()?;

        let result = self.discover_internal(clear).await;
        self.record(result)
    }

    async fn discover_internal(&mut self, clear: bool) -> Result<BTreeMap<String, SocketAddr>> {
        let timeout = self.config.discovery_timeout;
        let transport = self.transport().await?;
        let discovered = transport.discover(timeout, clear).await?;
        debug!("Discovered {} device(s)", discovered.len());
        Ok(discovered.clone())
    }

    /// All devices discovered so far.
    pub fn discovered_devices(&self) -> BTreeMap<String, SocketAddr> {
        match &self.transport {
            Some(transport) => transport.discovered().clone(),
            None => BTreeMap::new(),
        }
    }

    /// Select a manually given device address, bypassing discovery.
    pub async fn select_manual(&mut self, addr: SocketAddr) -> Result<Target> {
        self.select(Target::Manual { addr }).await
    }

    /// Select the device with the given id.
    ///
    /// Discovery is repeated until the device shows up or the configured
    /// device wait timeout expires.
    pub async fn select_device_id(&mut self, device_id: &str) -> Result<Target> {
        let deadline = Instant::now() + self.config.device_wait_timeout;
        let mut discovered_once = false;

        loop {
            let discovered = self.discovered_devices();
            match session::select_target(None, Some(device_id), &discovered) {
                Ok(target) => return self.select(target).await,
                Err(err) => {
                    if discovered_once && Instant::now() >= deadline {
                        return self.record(Err(err));
                    }
                }
            }

            trace!("Waiting for {} to show up", device_id);
            self.discover(false).await?;
            discovered_once = true;
        }
    }

    /// Select the discovered device with the lexicographically first id.
    pub async fn select_first_discovered(&mut self) -> Result<Target> {
        let discovered = self.discovered_devices();
        let target = session::select_target(None, None, &discovered);
        let target = self.record(target)?;
        self.select(target).await
    }

    async fn select(&mut self, target: Target) -> Result<Target> {
        self.session.lock().select(target.clone())?;

        let result = match &target {
            Target::Manual { addr } => self.transport().await.map(|transport| {
                transport.bind_manual(*addr);
            }),
            Target::DeviceId { device_id, .. } | Target::FirstDiscovered { device_id, .. } => {
                match self.transport().await {
                    Ok(transport) => transport.bind_discovered(device_id).map(drop),
                    Err(err) => Err(err),
                }
            }
        };

        self.record(result)?;
        Ok(target)
    }

    /// Send the connect request to the selected device and start receiving.
    ///
    /// Use `wait_for_connection` to wait for the device's answer.
    pub async fn connect(&mut self) -> Result<()> {
        let ids = self.session.lock().begin_connect()?;

        let link = match &self.transport {
            Some(transport) => transport.link(),
            None => Err(TransportError::new(
                TransportErrorKind::NoEndpoint,
                "no remote endpoint selected",
            )
            .into()),
        };
        let link = self.record(link)?;

        info!("Connecting to {} as {}", link.remote(), self.email);
        let result = link.send(&codec::encode_connect(ids, &self.email)).await;
        self.record(result)?;

        // a single pending event is enough to wake a waiter, it re-checks the session
        let (sender, receiver) = channel::bounded(1);

        let handle = task::spawn(receive_loop(
            link.clone(),
            self.session.clone(),
            sender,
            self.email.clone(),
            self.config.clone(),
        ));

        self.link = Some(link);
        self.events = Some(receiver);
        self.receive_loop = Some(handle);

        Ok(())
    }

    async fn wait_until<T, F>(&self, timeout: Duration, check: F) -> Option<T>
    where
        F: Fn(&Session) -> Option<T>,
    {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(result) = check(&*self.session.lock()) {
                return Some(result);
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            let events = self.events.as_ref()?;

            match async_std::future::timeout(remaining, events.recv()).await {
                Ok(Ok(event)) => {
                    trace!("Woken up by {:?}", event);
                }
                Ok(Err(_)) | Err(_) => {
                    return check(&*self.session.lock());
                }
            }
        }
    }

    /// Wait until the device answered the connect request.
    ///
    /// A timeout is reported as `Error::ConnectTimeout` and leaves the
    /// session untouched, the answer may still arrive later.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let result = self
            .wait_until(timeout, |session| match session.phase() {
                Phase::AwaitingData | Phase::DataReady => Some(Ok(())),
                Phase::Connecting => None,
                Phase::Error(code) => Some(Err(Error::ConnectRejected(code.clone()))),
                phase => Some(Err(Error::InvalidState {
                    operation: "wait_for_connection",
                    phase: phase.to_string(),
                })),
            })
            .await;

        result.unwrap_or(Err(Error::ConnectTimeout))
    }

    /// Wait until the first data frame arrived, returning whether it did.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |session| match session.phase() {
            Phase::DataReady => Some(true),
            Phase::Connecting | Phase::AwaitingData => None,
            _ => Some(false),
        })
        .await
        .unwrap_or(false)
    }

    /// Wait until the device reported its setpoints, returning whether it did.
    pub async fn wait_for_setpoints(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |session| match session.phase() {
            Phase::DataReady if !session.setpoints().is_empty() => Some(true),
            Phase::Connecting | Phase::AwaitingData | Phase::DataReady => None,
            _ => Some(false),
        })
        .await
        .unwrap_or(false)
    }

    /// The coarse connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.session.lock().status()
    }

    /// The current session phase.
    pub fn phase(&self) -> Phase {
        self.session.lock().phase().clone()
    }

    /// The code of the failure that ended the session, if any.
    pub fn connection_error(&self) -> Option<String> {
        self.session.lock().connection_error().map(str::to_string)
    }

    /// The selected target.
    pub fn target(&self) -> Option<Target> {
        self.session.lock().target().cloned()
    }

    /// Whether the device reported the key at all.
    pub fn provides_value<K: Into<Key>>(&self, key: K) -> bool {
        self.session.lock().provides_value(key.into())
    }

    /// Whether a value is available for the key.
    pub fn has_value<K: Into<Key>>(&self, key: K) -> bool {
        self.session.lock().has_value(key.into())
    }

    /// The last reported value of the key, `None` if there is none.
    pub fn get_value<K: Into<Key>>(&self, key: K) -> Option<f64> {
        self.session.lock().get_value(key.into())
    }

    /// The device reported bounds of a setpoint.
    pub fn get_setpoint_bounds(&self, key: SetpointKey) -> Option<SetpointRange> {
        self.session.lock().get_setpoint_bounds(key)
    }

    /// A snapshot of all datapoints with a value.
    pub fn datapoints(&self) -> BTreeMap<DatapointKey, f64> {
        self.session.lock().datapoints().clone()
    }

    /// A snapshot of all reported setpoints.
    pub fn setpoints(&self) -> BTreeMap<SetpointKey, SetpointState> {
        self.session.lock().setpoints().clone()
    }

    /// Write a setpoint and verify the device applied it.
    ///
    /// The value is checked against the device reported bounds first, nothing
    /// is sent if that fails. After the write the client waits for the
    /// settle delay, asks the device to push its setpoint state, waits for
    /// the readback delay and compares the current value with the requested
    /// one. Returns the value read back. A mismatch is not retried.
    pub async fn set_setpoint(&self, key: SetpointKey, value: f64) -> Result<f64> {
        let (ids, range) = {
            let session = self.session.lock();
            let range = session.check_setpoint(key, value)?;
            (session.ids(), range)
        };

        let link = match &self.link {
            Some(link) => link.clone(),
            None => {
                return Err(TransportError::new(
                    TransportErrorKind::NoEndpoint,
                    "not connected",
                )
                .into())
            }
        };

        info!(
            "Writing {} = {} (range {}..{})",
            key, value, range.min, range.max
        );
        link.send(&codec::encode_setpoint_write(ids, key, value))
            .await?;

        task::sleep(self.config.settle_delay).await;

        link.send(&codec::encode_setpoint_state_request(
            ids,
            SETPOINT_STATE_REQUEST_CODE,
        ))
        .await?;

        task::sleep(self.config.readback_delay).await;

        let result = self.session.lock().verify_readback(key, value);
        match &result {
            Ok(readback) => info!("Readback of {} is {}", key, readback),
            Err(err) => warn!("Readback of {} failed: {}", key, err),
        }
        result
    }

    /// End the session and release the socket.
    ///
    /// Safe to call in any phase and more than once.
    pub async fn close(&mut self) {
        if self.session.lock().close() {
            debug!("Closing session");
        }

        self.events = None;
        self.link = None;

        if let Some(handle) = self.receive_loop.take() {
            if handle.cancel().await.is_some() {
                trace!("Receive loop had already finished");
            }
        }

        if let Some(transport) = self.transport.take() {
            if let Ok(addr) = transport.local_addr() {
                debug!("Releasing socket {}", addr);
            }
        }
    }
}

async fn receive_loop(
    link: Link,
    session: Arc<Mutex<Session>>,
    events: Sender<SessionEvent>,
    email: String,
    config: ClientConfig,
) {
    let mut last_connect = Instant::now();
    let mut last_request: Option<Instant> = None;

    loop {
        if events.is_closed() {
            break;
        }

        let (phase, ids) = {
            let session = session.lock();
            (session.phase().clone(), session.ids())
        };

        let outbound = match phase {
            Phase::Connecting if last_connect.elapsed() >= config.connect_retry_interval => {
                trace!("Retransmitting connect request");
                last_connect = Instant::now();
                Some(codec::encode_connect(ids, &email))
            }
            Phase::AwaitingData | Phase::DataReady
                if last_request.map_or(true, |at| at.elapsed() >= config.refresh_interval) =>
            {
                trace!("Requesting data");
                last_request = Some(Instant::now());
                Some(codec::encode_data_request(ids))
            }
            Phase::Error(_) | Phase::Closed => break,
            _ => None,
        };

        if let Some(bytes) = outbound {
            if let Err(err) = link.send(&bytes).await {
                warn!("Unable to send to {}: {}", link.remote(), err);
                session.lock().fail(err.code());
                break;
            }
        }

        match link.receive(config.poll_interval).await {
            Ok(Some(bytes)) => {
                let event = session.lock().handle_frame(&bytes);
                if let Some(event) = event {
                    if let Err(TrySendError::Closed(_)) = events.try_send(event) {
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Unable to receive from {}: {}", link.remote(), err);
                session.lock().fail(err.code());
                break;
            }
        }
    }

    debug!("Receive loop for {} ended", link.remote());
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{test_client_config, FakeDevice, FakeDeviceConfig, DEVICE_ID};

    use super::*;

    async fn connected_client(device: &FakeDevice) -> Result<DeviceClient> {
        let mut client = DeviceClient::new("me@example.com", test_client_config());
        client.select_manual(device.addr()).await?;
        client.connect().await?;
        client.wait_for_connection(Duration::from_secs(2)).await?;
        assert!(client.wait_for_data(Duration::from_secs(2)).await);
        Ok(client)
    }

    #[test]
    fn test_connect_and_read() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig::default()).await?;

            let mut client = connected_client(&device).await?;
            assert_eq!(ConnectionStatus::Connected, client.status());
            assert_eq!(
                Some(Target::Manual {
                    addr: device.addr()
                }),
                client.target()
            );

            assert_eq!(Some(21.5), client.get_value(DatapointKey::TempSupply));
            assert_eq!(Some(45.0), client.get_value(DatapointKey::Humidity));
            assert!(!client.has_value(DatapointKey::Co2Level));
            assert_eq!(None, client.get_value(DatapointKey::Co2Level));

            // setpoints arrive in a second frame
            task::sleep(Duration::from_millis(100)).await;
            assert_eq!(Some(3.0), client.get_value(SetpointKey::FanSpeed));
            assert_eq!(
                Some(SetpointRange {
                    min: 0.0,
                    max: 4.0,
                    step: 1.0
                }),
                client.get_setpoint_bounds(SetpointKey::FanSpeed)
            );

            device.with_log(|log| {
                assert_eq!(vec!["me@example.com".to_string()], log.emails);
                assert!(log.data_requests >= 1);
                assert_eq!(0, log.discovery_probes);
            });

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_refresh_keeps_values_current() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig {
                drift: 1,
                ..FakeDeviceConfig::default()
            })
            .await?;

            let config = ClientConfig {
                refresh_interval: Duration::from_millis(50),
                ..test_client_config()
            };
            let mut client = DeviceClient::new("me@example.com", config);
            client.select_manual(device.addr()).await?;
            client.connect().await?;
            client.wait_for_connection(Duration::from_secs(2)).await?;
            assert!(client.wait_for_data(Duration::from_secs(2)).await);
            let first = client.get_value(DatapointKey::TempSupply).unwrap();

            task::sleep(Duration::from_millis(400)).await;

            assert!(device.with_log(|log| log.data_requests) >= 3);
            assert!(client.get_value(DatapointKey::TempSupply).unwrap() > first);

            // nobody waits, the pending events stay bounded
            assert!(client.events.as_ref().unwrap().len() <= 1);

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_wait_for_data_after_session_failure() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig {
                datapoints: Vec::new(),
                setpoints: Vec::new(),
                ..FakeDeviceConfig::default()
            })
            .await?;

            let mut client = DeviceClient::new("me@example.com", test_client_config());
            client.select_manual(device.addr()).await?;
            client.connect().await?;
            client.wait_for_connection(Duration::from_secs(2)).await?;

            client.session.lock().fail("transport_receive");

            assert!(!client.wait_for_data(Duration::from_secs(1)).await);
            assert_eq!(Some("transport_receive".into()), client.connection_error());

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_select_first_discovered() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig::default()).await?;

            let mut config = test_client_config();
            config.broadcast_addr = device.addr();

            let mut client = DeviceClient::new("me@example.com", config);
            let discovered = client.discover(true).await?;
            assert_eq!(Some(&device.addr()), discovered.get(DEVICE_ID));

            let target = client.select_first_discovered().await?;
            assert_eq!(
                Target::FirstDiscovered {
                    device_id: DEVICE_ID.into(),
                    addr: device.addr(),
                },
                target
            );

            client.connect().await?;
            client.wait_for_connection(Duration::from_secs(2)).await?;

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_select_device_id() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig::default()).await?;

            let mut config = test_client_config();
            config.broadcast_addr = device.addr();

            let mut client = DeviceClient::new("me@example.com", config.clone());
            let target = client.select_device_id(DEVICE_ID).await?;
            assert_eq!(Some(DEVICE_ID), target.device_id());
            client.close().await;

            let mut client = DeviceClient::new("me@example.com", config);
            let err = client
                .select_device_id("99999.remote.lscontrol.dk")
                .await
                .unwrap_err();
            assert_eq!("device_not_discovered", err.code());
            assert_eq!(ConnectionStatus::Error, client.status());
            assert_eq!(
                Some("device_not_discovered".to_string()),
                client.connection_error()
            );
            assert!(device.with_log(|log| log.discovery_probes) >= 2);

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_connect_rejected() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig {
                connect_status: codec::CONNECT_UNKNOWN_USER,
                ..FakeDeviceConfig::default()
            })
            .await?;

            let mut client = DeviceClient::new("stranger@example.com", test_client_config());
            client.select_manual(device.addr()).await?;
            client.connect().await?;

            let err = client
                .wait_for_connection(Duration::from_secs(2))
                .await
                .unwrap_err();
            assert_eq!("unknown_user", err.code());
            assert!(!client.wait_for_data(Duration::from_millis(50)).await);

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_connect_timeout_keeps_session() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig {
                answer_connect: false,
                ..FakeDeviceConfig::default()
            })
            .await?;

            let mut client = DeviceClient::new("me@example.com", test_client_config());
            client.select_manual(device.addr()).await?;
            client.connect().await?;

            assert_eq!(
                Err(Error::ConnectTimeout),
                client.wait_for_connection(Duration::from_millis(300)).await
            );
            assert_eq!(ConnectionStatus::Connecting, client.status());
            assert!(device.with_log(|log| log.emails.len()) >= 2);

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_set_setpoint() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig::default()).await?;
            let mut client = connected_client(&device).await?;
            task::sleep(Duration::from_millis(100)).await;

            let readback = client.set_setpoint(SetpointKey::FanSpeed, 4.0).await?;
            assert_eq!(4.0, readback);
            assert_eq!(Some(4.0), client.get_value(SetpointKey::FanSpeed));

            let readback = client.set_setpoint(SetpointKey::TempSetpoint, 22.5).await?;
            assert_eq!(22.5, readback);

            device.with_log(|log| {
                assert_eq!(
                    vec![
                        (Some(SetpointKey::FanSpeed), 4),
                        (Some(SetpointKey::TempSetpoint), 225)
                    ],
                    log.writes
                );
                assert_eq!(vec![201, 201], log.state_requests);
            });

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_set_setpoint_readback_mismatch() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig {
                apply_writes: false,
                ..FakeDeviceConfig::default()
            })
            .await?;
            let mut client = connected_client(&device).await?;
            task::sleep(Duration::from_millis(100)).await;

            let err = client
                .set_setpoint(SetpointKey::FanSpeed, 4.0)
                .await
                .unwrap_err();
            assert_eq!(
                Error::ReadbackMismatch {
                    requested: 4.0,
                    observed: Some(3.0)
                },
                err
            );
            assert_eq!(1, device.with_log(|log| log.writes.len()));

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_set_setpoint_out_of_range() -> Result<()> {
        task::block_on(async {
            let device = FakeDevice::start(FakeDeviceConfig {
                setpoints: vec![(100, 3, 0, 6, 1)],
                ..FakeDeviceConfig::default()
            })
            .await?;
            let mut client = connected_client(&device).await?;
            task::sleep(Duration::from_millis(100)).await;

            let err = client
                .set_setpoint(SetpointKey::FanSpeed, 7.0)
                .await
                .unwrap_err();
            assert_eq!(
                Error::OutOfRange {
                    value: 7.0,
                    min: 0.0,
                    max: 6.0
                },
                err
            );

            let err = client
                .set_setpoint(SetpointKey::Co2Setpoint, 800.0)
                .await
                .unwrap_err();
            assert_eq!("setpoint_not_supported", err.code());

            device.with_log(|log| {
                assert!(log.writes.is_empty());
                assert!(log.state_requests.is_empty());
            });

            client.close().await;
            Ok(())
        })
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        task::block_on(async {
            let mut client = DeviceClient::new("me@example.com", test_client_config());
            client.close().await;
            client.close().await;
            assert_eq!(Phase::Closed, client.phase());

            let device = FakeDevice::start(FakeDeviceConfig::default()).await?;
            let mut client = connected_client(&device).await?;
            client.close().await;
            client.close().await;
            assert_eq!(ConnectionStatus::Disconnected, client.status());
            assert_eq!("invalid_state", client.connect().await.unwrap_err().code());
            assert!(!client.wait_for_data(Duration::from_millis(10)).await);
            Ok(())
        })
    }
}
