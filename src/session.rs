use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::SocketAddr,
};

use log::{debug, info, trace};

use serde::Serialize;

use crate::{
    codec::{self, Frame, Reading, SessionIds},
    error::{Error, Result},
    keys::{DatapointKey, Key, SetpointKey, SetpointRange},
};

/// The phase of a `Session`.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Nothing happened yet.
    Idle,
    /// Discovery is running or has finished without a selection.
    Discovering,
    /// A target was selected, no connect request sent yet.
    TargetSelected,
    /// The connect request was sent, waiting for the device's answer.
    Connecting,
    /// Connected, no data frame received yet.
    AwaitingData,
    /// Connected and at least one data frame received.
    DataReady,
    /// Terminal failure, carrying the report code.
    Error(String),
    /// Closed by the caller.
    Closed,
}

impl Phase {
    /// The coarse connection status derived from this phase.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Phase::Idle | Phase::Discovering | Phase::TargetSelected | Phase::Closed => {
                ConnectionStatus::Disconnected
            }
            Phase::Connecting => ConnectionStatus::Connecting,
            Phase::AwaitingData | Phase::DataReady => ConnectionStatus::Connected,
            Phase::Error(_) => ConnectionStatus::Error,
        }
    }

    /// Whether no further transitions except `Closed` are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Error(_) | Phase::Closed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("idle"),
            Phase::Discovering => f.write_str("discovering"),
            Phase::TargetSelected => f.write_str("target_selected"),
            Phase::Connecting => f.write_str("connecting"),
            Phase::AwaitingData => f.write_str("awaiting_data"),
            Phase::DataReady => f.write_str("data_ready"),
            Phase::Error(code) => write!(f, "error({})", code),
            Phase::Closed => f.write_str("closed"),
        }
    }
}

/// Coarse connection status as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected.
    Disconnected,
    /// Connect request sent.
    Connecting,
    /// Connected.
    Connected,
    /// Failed.
    Error,
}

/// The device a session talks to and how it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A manually given address, discovery was bypassed.
    Manual {
        /// The device address.
        addr: SocketAddr,
    },
    /// An explicitly requested device id found by discovery.
    DeviceId {
        /// The device id.
        device_id: String,
        /// The address it was discovered at.
        addr: SocketAddr,
    },
    /// The first discovered device in device id order.
    FirstDiscovered {
        /// The device id.
        device_id: String,
        /// The address it was discovered at.
        addr: SocketAddr,
    },
}

impl Target {
    /// The remote address of the device.
    pub fn addr(&self) -> SocketAddr {
        match self {
            Target::Manual { addr } => *addr,
            Target::DeviceId { addr, .. } => *addr,
            Target::FirstDiscovered { addr, .. } => *addr,
        }
    }

    /// The device id, unknown for manual targets.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Target::Manual { .. } => None,
            Target::DeviceId { device_id, .. } => Some(device_id),
            Target::FirstDiscovered { device_id, .. } => Some(device_id),
        }
    }
}

/// Pick a target: a manual address wins over a device id, which wins over
/// the first discovered device in device id order.
pub fn select_target(
    manual: Option<SocketAddr>,
    device_id: Option<&str>,
    discovered: &BTreeMap<String, SocketAddr>,
) -> Result<Target> {
    if let Some(addr) = manual {
        return Ok(Target::Manual { addr });
    }

    if let Some(device_id) = device_id {
        return match discovered.get(device_id) {
            Some(addr) => Ok(Target::DeviceId {
                device_id: device_id.to_string(),
                addr: *addr,
            }),
            None => Err(Error::DeviceNotDiscovered(device_id.to_string())),
        };
    }

    match discovered.iter().next() {
        Some((device_id, addr)) => Ok(Target::FirstDiscovered {
            device_id: device_id.clone(),
            addr: *addr,
        }),
        None => Err(Error::NoDevicesDiscovered),
    }
}

/// The last reported state of a setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SetpointState {
    /// The current value, `None` if the device has no reading.
    pub value: Option<f64>,
    /// Lowest accepted value.
    pub min: f64,
    /// Highest accepted value.
    pub max: f64,
    /// Increment between accepted values.
    pub step: f64,
}

impl SetpointState {
    /// The bounds of this setpoint.
    pub fn range(&self) -> SetpointRange {
        SetpointRange {
            min: self.min,
            max: self.max,
            step: self.step,
        }
    }
}

/// A noteworthy outcome of `Session::handle_frame`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The device accepted the connect request.
    Connected,
    /// The device rejected the connect request.
    ConnectFailed(String),
    /// The first data frame arrived.
    DataReady,
    /// A later data frame updated some values.
    Updated,
}

/// The state of one connection attempt to one device.
///
/// A `Session` performs no I/O: discovery results, selections and inbound
/// datagrams are fed into it and it tracks the phase and the values
/// reported so far.
#[derive(Debug)]
pub struct Session {
    ids: SessionIds,
    phase: Phase,
    target: Option<Target>,
    connection_error: Option<String>,
    datapoints: BTreeMap<DatapointKey, f64>,
    setpoints: BTreeMap<SetpointKey, SetpointState>,
    provided: BTreeSet<Key>,
    data_received: bool,
    frames_accepted: u64,
    frames_dropped: u64,
}

impl Session {
    /// Create a new idle session using `client_id` as client session id.
    pub fn new(client_id: u32) -> Session {
        Session {
            ids: SessionIds {
                client_id,
                server_id: 0,
            },
            phase: Phase::Idle,
            target: None,
            connection_error: None,
            datapoints: BTreeMap::new(),
            setpoints: BTreeMap::new(),
            provided: BTreeSet::new(),
            data_received: false,
            frames_accepted: 0,
            frames_dropped: 0,
        }
    }

    /// The session ids, the server id is `0` until connected.
    pub fn ids(&self) -> SessionIds {
        self.ids
    }

    /// The current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// The coarse connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.phase.status()
    }

    /// The selected target.
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// The code of the failure that moved the session into `Phase::Error`.
    pub fn connection_error(&self) -> Option<&str> {
        self.connection_error.as_deref()
    }

    /// Whether at least one data frame was received.
    pub fn data_received(&self) -> bool {
        self.data_received
    }

    /// Number of accepted and dropped datagrams.
    pub fn frame_counts(&self) -> (u64, u64) {
        (self.frames_accepted, self.frames_dropped)
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            phase: self.phase.to_string(),
        }
    }

    fn transition(&mut self, phase: Phase) {
        debug!("Session {:08X}: {} -> {}", self.ids.client_id, self.phase, phase);
        self.phase = phase;
    }

    /// Enter `Phase::Discovering`.
    pub fn begin_discovery(&mut self) -> Result<()> {
        match self.phase {
            Phase::Idle | Phase::Discovering => {
                self.transition(Phase::Discovering);
                Ok(())
            }
            _ => Err(self.invalid("discover")),
        }
    }

    /// Select the target to connect to.
    ///
    /// A manual target may be selected without a prior discovery.
    pub fn select(&mut self, target: Target) -> Result<()> {
        match self.phase {
            Phase::Idle | Phase::Discovering | Phase::TargetSelected => {
                info!("Selected {:?}", target);
                self.target = Some(target);
                self.transition(Phase::TargetSelected);
                Ok(())
            }
            _ => Err(self.invalid("select")),
        }
    }

    /// Enter `Phase::Connecting` and return the ids to use in the connect request.
    pub fn begin_connect(&mut self) -> Result<SessionIds> {
        match self.phase {
            Phase::TargetSelected => {
                self.ids.server_id = 0;
                self.transition(Phase::Connecting);
                Ok(self.ids)
            }
            _ => Err(self.invalid("connect")),
        }
    }

    /// Move into the terminal `Phase::Error`, recording `code`.
    ///
    /// Has no effect on a closed or already failed session.
    pub fn fail<S: Into<String>>(&mut self, code: S) {
        if self.phase.is_terminal() {
            return;
        }

        let code = code.into();
        info!("Session {:08X} failed: {}", self.ids.client_id, code);
        self.connection_error = Some(code.clone());
        self.transition(Phase::Error(code));
    }

    /// Move into `Phase::Closed`. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.phase == Phase::Closed {
            false
        } else {
            self.transition(Phase::Closed);
            true
        }
    }

    /// Process an inbound datagram.
    ///
    /// Datagrams that do not decode, belong to another session or do not
    /// fit the current phase are dropped without touching any state.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Option<SessionEvent> {
        if self.phase.is_terminal() {
            trace!("Ignoring datagram while {}", self.phase);
            return None;
        }

        let frame = match codec::decode_frame(bytes, self.ids.client_id) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("Dropping datagram: {}", err);
                self.frames_dropped += 1;
                return None;
            }
        };

        self.frames_accepted += 1;

        match (frame, self.phase.clone()) {
            (Frame::ConnectAccepted { server_id }, Phase::Connecting) => {
                self.ids.server_id = server_id;
                info!(
                    "Session {:08X} connected, server id {:08X}",
                    self.ids.client_id, server_id
                );
                self.transition(Phase::AwaitingData);
                Some(SessionEvent::Connected)
            }
            (Frame::ConnectRejected { status }, Phase::Connecting) => {
                let code = if status == codec::CONNECT_UNKNOWN_USER {
                    "unknown_user".to_string()
                } else {
                    format!("connect_rejected_{}", status)
                };
                self.fail(code.clone());
                Some(SessionEvent::ConnectFailed(code))
            }
            (Frame::Data { readings, .. }, Phase::AwaitingData) => {
                if readings.is_empty() {
                    return None;
                }
                self.apply(readings);
                self.data_received = true;
                self.transition(Phase::DataReady);
                Some(SessionEvent::DataReady)
            }
            (Frame::Data { readings, .. }, Phase::DataReady) => {
                if readings.is_empty() {
                    return None;
                }
                self.apply(readings);
                Some(SessionEvent::Updated)
            }
            (frame, phase) => {
                trace!("Ignoring {:?} while {}", frame, phase);
                None
            }
        }
    }

    fn apply(&mut self, readings: Vec<Reading>) {
        for reading in readings {
            match reading {
                Reading::Datapoint { key, value } => {
                    self.provided.insert(key.into());
                    match value {
                        Some(value) => {
                            self.datapoints.insert(key, value);
                        }
                        None => {
                            self.datapoints.remove(&key);
                        }
                    }
                }
                Reading::Setpoint { key, value, range } => {
                    self.provided.insert(key.into());
                    // bounds do not change during a session
                    self.setpoints
                        .entry(key)
                        .and_modify(|state| state.value = value)
                        .or_insert(SetpointState {
                            value,
                            min: range.min,
                            max: range.max,
                            step: range.step,
                        });
                }
            }
        }
    }

    /// Whether the device reported the key at all, with or without a value.
    pub fn provides_value(&self, key: Key) -> bool {
        self.provided.contains(&key)
    }

    /// Whether a value is available for the key.
    pub fn has_value(&self, key: Key) -> bool {
        self.get_value(key).is_some()
    }

    /// The last reported value of the key.
    pub fn get_value(&self, key: Key) -> Option<f64> {
        match key {
            Key::Datapoint(key) => self.datapoints.get(&key).copied(),
            Key::Setpoint(key) => self.setpoints.get(&key).and_then(|state| state.value),
        }
    }

    /// The device reported bounds of a setpoint.
    pub fn get_setpoint_bounds(&self, key: SetpointKey) -> Option<SetpointRange> {
        self.setpoints.get(&key).map(SetpointState::range)
    }

    /// All datapoints with a value.
    pub fn datapoints(&self) -> &BTreeMap<DatapointKey, f64> {
        &self.datapoints
    }

    /// All reported setpoints.
    pub fn setpoints(&self) -> &BTreeMap<SetpointKey, SetpointState> {
        &self.setpoints
    }

    /// Check whether `value` may be written to `key` and return its bounds.
    pub fn check_setpoint(&self, key: SetpointKey, value: f64) -> Result<SetpointRange> {
        if self.phase != Phase::DataReady {
            return Err(self.invalid("set_setpoint"));
        }

        let range = self
            .get_setpoint_bounds(key)
            .ok_or_else(|| Error::UnsupportedKey(key.name().to_string()))?;

        if !range.contains(value) {
            return Err(Error::OutOfRange {
                value,
                min: range.min,
                max: range.max,
            });
        }

        let info = key.info();
        if info.from_raw(info.to_raw(value)) != value {
            return Err(Error::NotRepresentable {
                value,
                resolution: info.resolution(),
            });
        }

        Ok(range)
    }

    /// Compare the current value of `key` with `requested` and return the
    /// observed value.
    pub fn verify_readback(&self, key: SetpointKey, requested: f64) -> Result<f64> {
        let observed = self.get_value(key.into());
        match observed {
            Some(value) if value == requested => Ok(value),
            _ => Err(Error::ReadbackMismatch {
                requested,
                observed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::{
        encode_connect_response, encode_datapoints_frame, encode_setpoints_frame,
        CONNECT_ACCEPTED, CONNECT_UNKNOWN_USER, DATA_REQUEST_CODE,
    };

    use super::*;

    const CLIENT_ID: u32 = 0x0102_0304;

    const IDS: SessionIds = SessionIds {
        client_id: CLIENT_ID,
        server_id: 0x0A0B_0C0D,
    };

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn connected_session() -> Session {
        let mut session = Session::new(CLIENT_ID);
        session
            .select(Target::Manual {
                addr: addr("127.0.0.1:5570"),
            })
            .unwrap();
        session.begin_connect().unwrap();
        assert_eq!(
            Some(SessionEvent::Connected),
            session.handle_frame(&encode_connect_response(IDS, CONNECT_ACCEPTED))
        );
        session
    }

    fn data_ready_session() -> Session {
        let mut session = connected_session();
        let frame = encode_setpoints_frame(
            IDS,
            DATA_REQUEST_CODE,
            &[(100, 3, 0, 6, 1), (101, 215, 100, 300, 5)],
        );
        assert_eq!(Some(SessionEvent::DataReady), session.handle_frame(&frame));
        session
    }

    #[test]
    fn test_select_target_precedence() {
        let mut discovered = BTreeMap::new();
        discovered.insert("b.remote.lscontrol.dk".to_string(), addr("10.0.0.2:5570"));
        discovered.insert("a.remote.lscontrol.dk".to_string(), addr("10.0.0.1:5570"));

        let manual = Some(addr("192.168.1.5:5570"));
        assert_eq!(
            Target::Manual {
                addr: addr("192.168.1.5:5570")
            },
            select_target(manual, Some("b.remote.lscontrol.dk"), &discovered).unwrap()
        );

        assert_eq!(
            Target::DeviceId {
                device_id: "b.remote.lscontrol.dk".into(),
                addr: addr("10.0.0.2:5570"),
            },
            select_target(None, Some("b.remote.lscontrol.dk"), &discovered).unwrap()
        );

        assert_eq!(
            Target::FirstDiscovered {
                device_id: "a.remote.lscontrol.dk".into(),
                addr: addr("10.0.0.1:5570"),
            },
            select_target(None, None, &discovered).unwrap()
        );

        assert_eq!(
            Error::DeviceNotDiscovered("c.remote.lscontrol.dk".into()),
            select_target(None, Some("c.remote.lscontrol.dk"), &discovered).unwrap_err()
        );

        assert_eq!(
            Error::NoDevicesDiscovered,
            select_target(None, None, &BTreeMap::new()).unwrap_err()
        );
    }

    #[test]
    fn test_fresh_session_has_no_values() {
        let session = Session::new(CLIENT_ID);
        assert_eq!(ConnectionStatus::Disconnected, session.status());

        for key in DatapointKey::ALL {
            assert!(!session.provides_value((*key).into()));
            assert!(!session.has_value((*key).into()));
            assert_eq!(None, session.get_value((*key).into()));
        }
        for key in SetpointKey::ALL {
            assert!(!session.has_value((*key).into()));
            assert_eq!(None, session.get_setpoint_bounds(*key));
        }
    }

    #[test]
    fn test_connect_transitions() {
        let mut session = Session::new(CLIENT_ID);
        assert!(session.begin_connect().is_err());

        session.begin_discovery().unwrap();
        assert_eq!(&Phase::Discovering, session.phase());

        session
            .select(Target::FirstDiscovered {
                device_id: "a.remote.lscontrol.dk".into(),
                addr: addr("10.0.0.1:5570"),
            })
            .unwrap();
        assert_eq!(&Phase::TargetSelected, session.phase());
        assert_eq!(Some("a.remote.lscontrol.dk"), session.target().unwrap().device_id());

        let ids = session.begin_connect().unwrap();
        assert_eq!(CLIENT_ID, ids.client_id);
        assert_eq!(0, ids.server_id);
        assert_eq!(ConnectionStatus::Connecting, session.status());

        // data before the connect ack is ignored
        let frame = encode_datapoints_frame(IDS, DATA_REQUEST_CODE, &[(20, 215)]);
        assert_eq!(None, session.handle_frame(&frame));

        let frame = encode_connect_response(IDS, CONNECT_ACCEPTED);
        assert_eq!(Some(SessionEvent::Connected), session.handle_frame(&frame));
        assert_eq!(IDS, session.ids());
        assert_eq!(&Phase::AwaitingData, session.phase());

        // retransmitted ack
        assert_eq!(None, session.handle_frame(&frame));

        let frame = encode_datapoints_frame(IDS, DATA_REQUEST_CODE, &[(20, 215)]);
        assert_eq!(Some(SessionEvent::DataReady), session.handle_frame(&frame));
        assert!(session.data_received());
        assert_eq!(Some(21.5), session.get_value(DatapointKey::TempSupply.into()));

        assert!(session.begin_discovery().is_err());
    }

    #[test]
    fn test_connect_rejected() {
        let mut session = Session::new(CLIENT_ID);
        session
            .select(Target::Manual {
                addr: addr("127.0.0.1:5570"),
            })
            .unwrap();
        session.begin_connect().unwrap();

        let frame = encode_connect_response(IDS, CONNECT_UNKNOWN_USER);
        assert_eq!(
            Some(SessionEvent::ConnectFailed("unknown_user".into())),
            session.handle_frame(&frame)
        );
        assert_eq!(ConnectionStatus::Error, session.status());
        assert_eq!(Some("unknown_user"), session.connection_error());

        // terminal
        let frame = encode_connect_response(IDS, CONNECT_ACCEPTED);
        assert_eq!(None, session.handle_frame(&frame));
        session.fail("other");
        assert_eq!(Some("unknown_user"), session.connection_error());

        let mut session = Session::new(CLIENT_ID);
        session
            .select(Target::Manual {
                addr: addr("127.0.0.1:5570"),
            })
            .unwrap();
        session.begin_connect().unwrap();
        let frame = encode_connect_response(IDS, 7);
        assert_eq!(
            Some(SessionEvent::ConnectFailed("connect_rejected_7".into())),
            session.handle_frame(&frame)
        );
    }

    #[test]
    fn test_last_value_wins() {
        let mut session = connected_session();

        let frame = encode_setpoints_frame(IDS, DATA_REQUEST_CODE, &[(100, 3, 0, 6, 1)]);
        assert_eq!(Some(SessionEvent::DataReady), session.handle_frame(&frame));
        assert_eq!(Some(3.0), session.get_value(SetpointKey::FanSpeed.into()));

        let frame = encode_setpoints_frame(IDS, DATA_REQUEST_CODE, &[(100, 4, 0, 6, 1)]);
        assert_eq!(Some(SessionEvent::Updated), session.handle_frame(&frame));
        assert_eq!(Some(4.0), session.get_value(SetpointKey::FanSpeed.into()));
    }

    #[test]
    fn test_corrupt_frame_keeps_values() {
        let mut session = connected_session();

        let frame = encode_datapoints_frame(IDS, DATA_REQUEST_CODE, &[(20, 215), (30, 45)]);
        session.handle_frame(&frame);

        let mut frame = encode_datapoints_frame(IDS, DATA_REQUEST_CODE, &[(20, 180), (30, 50)]);
        frame.truncate(frame.len() - 3);
        assert_eq!(None, session.handle_frame(&frame));
        assert_eq!(None, session.handle_frame(b"\x00\x01"));

        assert_eq!(Some(21.5), session.get_value(DatapointKey::TempSupply.into()));
        assert_eq!(Some(45.0), session.get_value(DatapointKey::Humidity.into()));
        assert_eq!(&Phase::DataReady, session.phase());
        assert_eq!((2, 2), session.frame_counts());
    }

    #[test]
    fn test_provided_without_value() {
        let mut session = connected_session();

        let frame = encode_datapoints_frame(IDS, DATA_REQUEST_CODE, &[(31, 612), (20, i16::MIN)]);
        session.handle_frame(&frame);

        assert!(session.provides_value(DatapointKey::TempSupply.into()));
        assert!(!session.has_value(DatapointKey::TempSupply.into()));
        assert_eq!(Some(612.0), session.get_value(DatapointKey::Co2Level.into()));
        assert!(!session.provides_value(DatapointKey::Humidity.into()));
    }

    #[test]
    fn test_check_setpoint() {
        let session = data_ready_session();

        assert_eq!(
            Error::OutOfRange {
                value: 7.0,
                min: 0.0,
                max: 6.0
            },
            session.check_setpoint(SetpointKey::FanSpeed, 7.0).unwrap_err()
        );
        assert!(session.check_setpoint(SetpointKey::FanSpeed, -1.0).is_err());
        assert!(session.check_setpoint(SetpointKey::FanSpeed, 0.0).is_ok());
        assert!(session.check_setpoint(SetpointKey::FanSpeed, 6.0).is_ok());
        assert!(session.check_setpoint(SetpointKey::FanSpeed, f64::NAN).is_err());

        assert!(session.check_setpoint(SetpointKey::TempSetpoint, 10.0).is_ok());
        assert!(session.check_setpoint(SetpointKey::TempSetpoint, 30.0).is_ok());
        assert!(session.check_setpoint(SetpointKey::TempSetpoint, 30.1).is_err());
        assert!(session.check_setpoint(SetpointKey::TempSetpoint, 21.3).is_ok());

        assert_eq!(
            Error::NotRepresentable {
                value: 3.6,
                resolution: 1.0
            },
            session.check_setpoint(SetpointKey::FanSpeed, 3.6).unwrap_err()
        );
        assert_eq!(
            "setpoint_not_representable",
            session
                .check_setpoint(SetpointKey::TempSetpoint, 21.55)
                .unwrap_err()
                .code()
        );

        assert_eq!(
            Error::UnsupportedKey("co2_setpoint".into()),
            session.check_setpoint(SetpointKey::Co2Setpoint, 800.0).unwrap_err()
        );

        let session = connected_session();
        assert_eq!(
            "invalid_state",
            session.check_setpoint(SetpointKey::FanSpeed, 3.0).unwrap_err().code()
        );
    }

    #[test]
    fn test_bounds_are_kept() {
        let mut session = data_ready_session();

        let frame = encode_setpoints_frame(IDS, DATA_REQUEST_CODE, &[(100, 5, 0, 9, 1)]);
        session.handle_frame(&frame);

        assert_eq!(Some(5.0), session.get_value(SetpointKey::FanSpeed.into()));
        assert_eq!(
            Some(SetpointRange {
                min: 0.0,
                max: 6.0,
                step: 1.0
            }),
            session.get_setpoint_bounds(SetpointKey::FanSpeed)
        );
    }

    #[test]
    fn test_verify_readback() {
        let mut session = data_ready_session();

        assert_eq!(
            Ok(21.5),
            session.verify_readback(SetpointKey::TempSetpoint, 21.5)
        );
        assert_eq!(
            Err(Error::ReadbackMismatch {
                requested: 22.0,
                observed: Some(21.5)
            }),
            session.verify_readback(SetpointKey::TempSetpoint, 22.0)
        );
        assert_eq!(
            Err(Error::ReadbackMismatch {
                requested: 800.0,
                observed: None
            }),
            session.verify_readback(SetpointKey::Co2Setpoint, 800.0)
        );

        let frame = encode_setpoints_frame(IDS, 201, &[(100, 4, 0, 6, 1)]);
        session.handle_frame(&frame);
        assert_eq!(Ok(4.0), session.verify_readback(SetpointKey::FanSpeed, 4.0));
        assert_eq!(
            Err(Error::ReadbackMismatch {
                requested: 3.6,
                observed: Some(4.0)
            }),
            session.verify_readback(SetpointKey::FanSpeed, 3.6)
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = data_ready_session();
        assert!(session.close());
        assert!(!session.close());
        assert_eq!(ConnectionStatus::Disconnected, session.status());

        let frame = encode_setpoints_frame(IDS, DATA_REQUEST_CODE, &[(100, 5, 0, 6, 1)]);
        assert_eq!(None, session.handle_frame(&frame));
        assert_eq!(Some(3.0), session.get_value(SetpointKey::FanSpeed.into()));
    }
}
