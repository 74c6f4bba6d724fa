use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_std::{net::UdpSocket, task};

use parking_lot::Mutex;

use crate::{
    codec::{self, RawSetpoint, Request, SessionIds},
    config::ClientConfig,
    keys::SetpointKey,
    Result,
};

pub(crate) const DEVICE_ID: &str = "12345.remote.lscontrol.dk";

pub(crate) const SERVER_ID: u32 = 0x5EED_0001;

/// How the simulated device behaves.
#[derive(Debug, Clone)]
pub(crate) struct FakeDeviceConfig {
    pub device_id: String,
    pub connect_status: u32,
    pub datapoints: Vec<(u16, i16)>,
    pub setpoints: Vec<RawSetpoint>,
    pub apply_writes: bool,
    pub answer_connect: bool,
    /// Added to the first datapoint after every data request.
    pub drift: i16,
}

impl Default for FakeDeviceConfig {
    fn default() -> FakeDeviceConfig {
        FakeDeviceConfig {
            device_id: DEVICE_ID.to_string(),
            connect_status: codec::CONNECT_ACCEPTED,
            datapoints: vec![(20, 215), (21, 52), (30, 45), (42, 1450)],
            setpoints: vec![(100, 3, 0, 4, 1), (101, 215, 100, 300, 5)],
            apply_writes: true,
            answer_connect: true,
            drift: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeDeviceLog {
    pub discovery_probes: usize,
    pub emails: Vec<String>,
    pub data_requests: usize,
    pub state_requests: Vec<u16>,
    pub writes: Vec<(Option<SetpointKey>, i16)>,
}

/// A simulated controller listening on a loopback UDP socket.
#[derive(Debug)]
pub(crate) struct FakeDevice {
    addr: SocketAddr,
    log: Arc<Mutex<FakeDeviceLog>>,
}

impl FakeDevice {
    pub(crate) async fn start(config: FakeDeviceConfig) -> Result<FakeDevice> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let log = Arc::new(Mutex::new(FakeDeviceLog::default()));

        let task_log = log.clone();
        task::spawn(async move {
            let mut config = config;
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let request = match codec::decode_request(&buf[0..len]) {
                    Ok(request) => request,
                    Err(_) => continue,
                };

                for reply in handle_request(&mut config, &task_log, request) {
                    drop(socket.send_to(&reply, from).await);
                }
            }
        });

        Ok(FakeDevice { addr, log })
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn with_log<T, F: FnOnce(&FakeDeviceLog) -> T>(&self, f: F) -> T {
        f(&self.log.lock())
    }
}

fn handle_request(
    config: &mut FakeDeviceConfig,
    log: &Mutex<FakeDeviceLog>,
    request: Request,
) -> Vec<Vec<u8>> {
    let mut log = log.lock();
    match request {
        Request::Discovery { .. } => {
            log.discovery_probes += 1;
            vec![codec::encode_discovery_response(&config.device_id)]
        }
        Request::Connect { client_id, email } => {
            log.emails.push(email);
            if !config.answer_connect {
                return Vec::new();
            }
            let ids = SessionIds {
                client_id,
                server_id: SERVER_ID,
            };
            vec![codec::encode_connect_response(ids, config.connect_status)]
        }
        Request::Data { ids, code } => {
            log.data_requests += 1;
            let mut replies = Vec::new();
            if !config.datapoints.is_empty() {
                replies.push(codec::encode_datapoints_frame(ids, code, &config.datapoints));
                config.datapoints[0].1 += config.drift;
            }
            if !config.setpoints.is_empty() {
                replies.push(codec::encode_setpoints_frame(ids, code, &config.setpoints));
            }
            replies
        }
        Request::SetpointState { ids, code } => {
            log.state_requests.push(code);
            vec![codec::encode_setpoints_frame(ids, code, &config.setpoints)]
        }
        Request::SetpointWrite { key, raw, .. } => {
            log.writes.push((key, raw));
            if let (true, Some(key)) = (config.apply_writes, key) {
                let address = key.info().address;
                for entry in config.setpoints.iter_mut() {
                    if entry.0 == address {
                        entry.1 = raw;
                    }
                }
            }
            Vec::new()
        }
    }
}

/// Client tunables scaled down for loopback tests.
pub(crate) fn test_client_config() -> ClientConfig {
    ClientConfig {
        local_addr: "127.0.0.1:0".parse().unwrap(),
        discovery_rounds: 1,
        discovery_timeout: Duration::from_millis(100),
        device_wait_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(1),
        connect_retry_interval: Duration::from_millis(50),
        data_timeout: Duration::from_secs(1),
        settle_delay: Duration::from_millis(50),
        readback_delay: Duration::from_millis(100),
        refresh_interval: Duration::from_secs(1),
        poll_interval: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}
