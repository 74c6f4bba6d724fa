//! Encoding and decoding of the Nabto datagrams spoken by the controllers.
//!
//! All functions in this module are pure. Multi-byte fields are big-endian.
//!
//! A session datagram starts with a 16 byte header:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | client session id                       |
//! | 4      | 4    | server session id                       |
//! | 8      | 1    | packet type (`0x83` connect, `0x16` data) |
//! | 9      | 1    | version (`0x02`)                        |
//! | 10     | 1    | retransmission count                    |
//! | 11     | 1    | flags (`0x40` marks a response)         |
//! | 12     | 2    | tag                                     |
//! | 14     | 2    | total length                            |
//!
//! followed by payloads, each with a 4 byte header (type, flags, length
//! including the header). Data travels inside a crypt payload whose body
//! starts with the crypt code `0x000A` and a command byte.
//!
//! Discovery uses its own, headerless format: the probe is `00 00 00 01`,
//! eight zero bytes, the device id pattern and a NUL byte; the reply starts
//! with `00 80 00 01` and carries the NUL terminated device id at offset 19.

use std::net::SocketAddr;

use serde::Serialize;

use crate::{
    error::DecodeError,
    keys::{DatapointKey, SetpointKey, SetpointRange, RAW_NO_VALUE},
};

/// The UDP port devices listen on for discovery and sessions.
pub const DEFAULT_PORT: u16 = 5570;

/// Domain all device ids of the supported controllers live under.
pub const DEVICE_DOMAIN: &str = "remote.lscontrol.dk";

/// Tag and request code of the periodic data request.
pub const DATA_REQUEST_CODE: u16 = 50;

/// Request code that forces the device to push its setpoint state.
pub const SETPOINT_STATE_REQUEST_CODE: u16 = 201;

const DISCOVERY_REQUEST: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const DISCOVERY_RESPONSE: [u8; 4] = [0x00, 0x80, 0x00, 0x01];
const DISCOVERY_ID_OFFSET: usize = 19;

const HEADER_LEN: usize = 16;
const PAYLOAD_HEADER_LEN: usize = 4;
const VERSION: u8 = 0x02;
const FLAG_RESPONSE: u8 = 0x40;

const PACKET_CONNECT: u8 = 0x83;
const PACKET_DATA: u8 = 0x16;

const PAYLOAD_IPX: u8 = 0x35;
const PAYLOAD_CRYPT: u8 = 0x36;
const PAYLOAD_NOTIFY: u8 = 0x3E;
const PAYLOAD_CP_ID: u8 = 0x3F;

const CRYPT_CODE_PLAIN: u16 = 0x000A;
const CP_ID_EMAIL: u8 = 0x01;

const CMD_SETPOINTS: u8 = 0x2A;
const CMD_SETPOINT_WRITE: u8 = 0x2B;
const CMD_DATAPOINTS: u8 = 0x2D;

const DATAPOINT_ENTRY_LEN: usize = 4;
const SETPOINT_ENTRY_LEN: usize = 10;

/// Connect status: the device accepted the client.
pub const CONNECT_ACCEPTED: u32 = 1;

/// Connect status: the email is not authorized on the device.
pub const CONNECT_UNKNOWN_USER: u32 = 2;

/// A device that answered a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// The device id, e.g. `"12345.remote.lscontrol.dk"`.
    pub device_id: String,
    /// The address the reply came from.
    pub address: SocketAddr,
}

impl DiscoveredDevice {
    /// The host part of the address.
    pub fn host(&self) -> String {
        self.address.ip().to_string()
    }

    /// The port part of the address.
    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

/// The pair of session ids that every session datagram carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionIds {
    /// Chosen by the client when connecting.
    pub client_id: u32,
    /// Assigned by the device in its connect response.
    pub server_id: u32,
}

/// A single decoded value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// A datapoint value, `None` if the device provides the key but has no reading.
    Datapoint {
        /// The key.
        key: DatapointKey,
        /// The value at native scale.
        value: Option<f64>,
    },
    /// A setpoint value together with its device reported bounds.
    Setpoint {
        /// The key.
        key: SetpointKey,
        /// The value at native scale.
        value: Option<f64>,
        /// The bounds at native scale.
        range: SetpointRange,
    },
}

/// A decoded session datagram sent by a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The device accepted the connect request.
    ConnectAccepted {
        /// The server session id assigned by the device.
        server_id: u32,
    },
    /// The device rejected the connect request.
    ConnectRejected {
        /// The status code sent by the device.
        status: u32,
    },
    /// Values pushed by the device.
    Data {
        /// The tag of the request this frame answers.
        tag: u16,
        /// The decoded values of known keys.
        readings: Vec<Reading>,
    },
}

/// A decoded datagram sent by a client, as seen from the device side.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Request {
    /// A discovery probe for the given device id pattern.
    Discovery {
        /// `"*"` for any device.
        pattern: String,
    },
    /// A connect request.
    Connect {
        /// The client session id.
        client_id: u32,
        /// The client's identity.
        email: String,
    },
    /// A request for datapoints and setpoints.
    Data {
        /// The session ids.
        ids: SessionIds,
        /// The request code.
        code: u16,
    },
    /// A request to push the setpoint state.
    SetpointState {
        /// The session ids.
        ids: SessionIds,
        /// The request code.
        code: u16,
    },
    /// A setpoint write.
    SetpointWrite {
        /// The session ids.
        ids: SessionIds,
        /// The key, `None` for an address not in the catalog.
        key: Option<SetpointKey>,
        /// The raw fixed-point value.
        raw: i16,
    },
}

struct Header {
    ids: SessionIds,
    packet_type: u8,
    flags: u8,
    tag: u16,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::new(format!("truncated {}", what)));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self, what: &str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, DecodeError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn i16(&mut self, what: &str) -> Result<i16, DecodeError> {
        let bytes = self.take(2, what)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, DecodeError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

fn build_payload(payload_type: u8, body: &[u8]) -> Vec<u8> {
    let len = (PAYLOAD_HEADER_LEN + body.len()) as u16;
    let mut buf = Vec::with_capacity(len as usize);
    buf.push(payload_type);
    buf.push(0x00);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

fn build_crypt_payload(body: &[u8]) -> Vec<u8> {
    let mut crypt = Vec::with_capacity(2 + body.len());
    crypt.extend_from_slice(&CRYPT_CODE_PLAIN.to_be_bytes());
    crypt.extend_from_slice(body);
    build_payload(PAYLOAD_CRYPT, &crypt)
}

fn build_packet(
    ids: SessionIds,
    packet_type: u8,
    flags: u8,
    tag: u16,
    payloads: &[Vec<u8>],
) -> Vec<u8> {
    let len = HEADER_LEN + payloads.iter().map(Vec::len).sum::<usize>();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&ids.client_id.to_be_bytes());
    buf.extend_from_slice(&ids.server_id.to_be_bytes());
    buf.push(packet_type);
    buf.push(VERSION);
    buf.push(0x00);
    buf.push(flags);
    buf.extend_from_slice(&tag.to_be_bytes());
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    for payload in payloads {
        buf.extend_from_slice(payload);
    }
    buf
}

fn parse_header(bytes: &[u8]) -> Result<(Header, &[u8]), DecodeError> {
    let mut reader = Reader::new(bytes);
    let client_id = reader.u32("header")?;
    let server_id = reader.u32("header")?;
    let packet_type = reader.u8("header")?;
    let version = reader.u8("header")?;
    let _retransmissions = reader.u8("header")?;
    let flags = reader.u8("header")?;
    let tag = reader.u16("header")?;
    let len = reader.u16("header")?;

    if version != VERSION {
        return Err(DecodeError::new(format!("unsupported version {}", version)));
    }
    if usize::from(len) != bytes.len() {
        return Err(DecodeError::new(format!(
            "length field {} does not match datagram length {}",
            len,
            bytes.len()
        )));
    }

    let header = Header {
        ids: SessionIds {
            client_id,
            server_id,
        },
        packet_type,
        flags,
        tag,
    };

    Ok((header, &bytes[HEADER_LEN..]))
}

fn find_payload(mut bytes: &[u8], wanted: u8) -> Result<&[u8], DecodeError> {
    while !bytes.is_empty() {
        let mut reader = Reader::new(bytes);
        let payload_type = reader.u8("payload header")?;
        let _flags = reader.u8("payload header")?;
        let len = usize::from(reader.u16("payload header")?);
        if len < PAYLOAD_HEADER_LEN || len > bytes.len() {
            return Err(DecodeError::new(format!("invalid payload length {}", len)));
        }
        if payload_type == wanted {
            return Ok(&bytes[PAYLOAD_HEADER_LEN..len]);
        }
        bytes = &bytes[len..];
    }

    Err(DecodeError::new(format!("missing payload 0x{:02X}", wanted)))
}

fn crypt_body(payloads: &[u8]) -> Result<&[u8], DecodeError> {
    let body = find_payload(payloads, PAYLOAD_CRYPT)?;
    let mut reader = Reader::new(body);
    let code = reader.u16("crypt code")?;
    if code != CRYPT_CODE_PLAIN {
        return Err(DecodeError::new(format!("unsupported crypt code 0x{:04X}", code)));
    }
    Ok(&body[2..])
}

fn decode_data_body(body: &[u8]) -> Result<Vec<Reading>, DecodeError> {
    let mut reader = Reader::new(body);
    let command = reader.u8("command")?;
    let count = usize::from(reader.u16("entry count")?);

    let entry_len = match command {
        CMD_DATAPOINTS => DATAPOINT_ENTRY_LEN,
        CMD_SETPOINTS => SETPOINT_ENTRY_LEN,
        _ => {
            return Err(DecodeError::new(format!(
                "unsupported command 0x{:02X}",
                command
            )))
        }
    };

    if reader.remaining() != count * entry_len {
        return Err(DecodeError::new(format!(
            "{} entries need {} bytes, got {}",
            count,
            count * entry_len,
            reader.remaining()
        )));
    }

    let mut readings = Vec::with_capacity(count);
    for _ in 0..count {
        let address = reader.u16("entry")?;
        let raw = reader.i16("entry")?;

        if command == CMD_DATAPOINTS {
            if let Some(key) = DatapointKey::from_address(address) {
                let info = key.info();
                let value = if raw == RAW_NO_VALUE {
                    None
                } else {
                    Some(info.from_raw(raw))
                };
                readings.push(Reading::Datapoint { key, value });
            }
        } else {
            let min = reader.i16("entry")?;
            let max = reader.i16("entry")?;
            let step = reader.u16("entry")?;

            if let Some(key) = SetpointKey::from_address(address) {
                let info = key.info();
                let value = if raw == RAW_NO_VALUE {
                    None
                } else {
                    Some(info.from_raw(raw))
                };
                let range = SetpointRange {
                    min: info.from_raw(min),
                    max: info.from_raw(max),
                    step: f64::from(step) / f64::from(info.scale),
                };
                readings.push(Reading::Setpoint { key, value, range });
            }
        }
    }

    Ok(readings)
}

/// Encode the discovery probe that asks every device to identify itself.
pub fn encode_discovery_probe() -> Vec<u8> {
    let mut buf = Vec::with_capacity(14);
    buf.extend_from_slice(&DISCOVERY_REQUEST);
    buf.extend_from_slice(&[0u8; 8]);
    buf.push(b'*');
    buf.push(0x00);
    buf
}

/// Decode a discovery reply received from `source`.
///
/// Only devices under `DEVICE_DOMAIN` are accepted.
pub fn decode_discovery_response(
    bytes: &[u8],
    source: SocketAddr,
) -> Result<DiscoveredDevice, DecodeError> {
    if bytes.len() <= DISCOVERY_ID_OFFSET {
        return Err(DecodeError::new("truncated discovery response"));
    }
    if bytes[0..4] != DISCOVERY_RESPONSE {
        return Err(DecodeError::new("not a discovery response"));
    }

    let id_bytes = &bytes[DISCOVERY_ID_OFFSET..];
    let id_len = id_bytes
        .iter()
        .position(|b| *b == 0x00)
        .unwrap_or_else(|| id_bytes.len());
    let device_id = std::str::from_utf8(&id_bytes[..id_len])
        .map_err(|_| DecodeError::new("device id is not ASCII"))?;

    if device_id.is_empty() {
        return Err(DecodeError::new("empty device id"));
    }
    if !device_id.ends_with(DEVICE_DOMAIN) {
        return Err(DecodeError::new(format!("foreign device {:?}", device_id)));
    }

    Ok(DiscoveredDevice {
        device_id: device_id.to_string(),
        address: source,
    })
}

/// Encode the connect request identifying the client by `email`.
pub fn encode_connect(ids: SessionIds, email: &str) -> Vec<u8> {
    let ipx = build_payload(PAYLOAD_IPX, &[0u8; 6]);

    let mut cp_id = Vec::with_capacity(1 + email.len());
    cp_id.push(CP_ID_EMAIL);
    cp_id.extend_from_slice(email.as_bytes());
    let cp_id = build_payload(PAYLOAD_CP_ID, &cp_id);

    let ids = SessionIds {
        client_id: ids.client_id,
        server_id: 0,
    };
    build_packet(ids, PACKET_CONNECT, 0x00, 0, &[ipx, cp_id])
}

/// Encode a request for the current datapoints and setpoints.
pub fn encode_data_request(ids: SessionIds) -> Vec<u8> {
    let mut body = vec![CMD_DATAPOINTS];
    body.extend_from_slice(&DATA_REQUEST_CODE.to_be_bytes());
    build_packet(ids, PACKET_DATA, 0x00, DATA_REQUEST_CODE, &[build_crypt_payload(&body)])
}

/// Encode a request that makes the device push its setpoint state.
pub fn encode_setpoint_state_request(ids: SessionIds, request_code: u16) -> Vec<u8> {
    let mut body = vec![CMD_SETPOINTS];
    body.extend_from_slice(&request_code.to_be_bytes());
    build_packet(ids, PACKET_DATA, 0x00, request_code, &[build_crypt_payload(&body)])
}

/// Encode a setpoint write, converting `value` with the key's fixed-point scale.
pub fn encode_setpoint_write(ids: SessionIds, key: SetpointKey, value: f64) -> Vec<u8> {
    let info = key.info();
    let mut body = vec![CMD_SETPOINT_WRITE];
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&info.address.to_be_bytes());
    body.extend_from_slice(&info.to_raw(value).to_be_bytes());
    build_packet(ids, PACKET_DATA, 0x00, 0, &[build_crypt_payload(&body)])
}

/// Decode the values carried by a data datagram.
///
/// Entries for addresses that are not part of the catalogs are skipped.
pub fn decode_data_frame(bytes: &[u8]) -> Result<Vec<Reading>, DecodeError> {
    let (header, payloads) = parse_header(bytes)?;
    if header.packet_type != PACKET_DATA {
        return Err(DecodeError::new(format!(
            "not a data packet: 0x{:02X}",
            header.packet_type
        )));
    }
    decode_data_body(crypt_body(payloads)?)
}

/// Decode any datagram a device sends to the client with session id `client_id`.
pub fn decode_frame(bytes: &[u8], client_id: u32) -> Result<Frame, DecodeError> {
    let (header, payloads) = parse_header(bytes)?;
    if header.ids.client_id != client_id {
        return Err(DecodeError::new(format!(
            "foreign session 0x{:08X}",
            header.ids.client_id
        )));
    }
    if header.flags & FLAG_RESPONSE == 0 {
        return Err(DecodeError::new("not a response"));
    }

    match header.packet_type {
        PACKET_CONNECT => {
            let body = find_payload(payloads, PAYLOAD_NOTIFY)?;
            let status = Reader::new(body).u32("connect status")?;
            if status == CONNECT_ACCEPTED {
                Ok(Frame::ConnectAccepted {
                    server_id: header.ids.server_id,
                })
            } else {
                Ok(Frame::ConnectRejected { status })
            }
        }
        PACKET_DATA => Ok(Frame::Data {
            tag: header.tag,
            readings: decode_data_body(crypt_body(payloads)?)?,
        }),
        other => Err(DecodeError::new(format!("unsupported packet type 0x{:02X}", other))),
    }
}

/// Encode a connect response, as a device would send it.
#[cfg(test)]
pub(crate) fn encode_connect_response(ids: SessionIds, status: u32) -> Vec<u8> {
    let notify = build_payload(PAYLOAD_NOTIFY, &status.to_be_bytes());
    build_packet(ids, PACKET_CONNECT, FLAG_RESPONSE, 0, &[notify])
}

/// Encode a discovery reply for `device_id`, as a device would send it.
#[cfg(test)]
pub(crate) fn encode_discovery_response(device_id: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DISCOVERY_ID_OFFSET + device_id.len() + 1);
    buf.extend_from_slice(&DISCOVERY_RESPONSE);
    buf.resize(DISCOVERY_ID_OFFSET, 0x00);
    buf.extend_from_slice(device_id.as_bytes());
    buf.push(0x00);
    buf
}

/// Encode a datapoint frame from `(address, raw)` pairs, as a device would send it.
#[cfg(test)]
pub(crate) fn encode_datapoints_frame(
    ids: SessionIds,
    tag: u16,
    entries: &[(u16, i16)],
) -> Vec<u8> {
    let mut body = vec![CMD_DATAPOINTS];
    body.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for (address, raw) in entries {
        body.extend_from_slice(&address.to_be_bytes());
        body.extend_from_slice(&raw.to_be_bytes());
    }
    build_packet(ids, PACKET_DATA, FLAG_RESPONSE, tag, &[build_crypt_payload(&body)])
}

/// A raw setpoint entry: address, value, minimum, maximum and step.
#[cfg(test)]
pub(crate) type RawSetpoint = (u16, i16, i16, i16, u16);

/// Encode a setpoint frame from raw entries, as a device would send it.
#[cfg(test)]
pub(crate) fn encode_setpoints_frame(
    ids: SessionIds,
    tag: u16,
    entries: &[RawSetpoint],
) -> Vec<u8> {
    let mut body = vec![CMD_SETPOINTS];
    body.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for (address, raw, min, max, step) in entries {
        body.extend_from_slice(&address.to_be_bytes());
        body.extend_from_slice(&raw.to_be_bytes());
        body.extend_from_slice(&min.to_be_bytes());
        body.extend_from_slice(&max.to_be_bytes());
        body.extend_from_slice(&step.to_be_bytes());
    }
    build_packet(ids, PACKET_DATA, FLAG_RESPONSE, tag, &[build_crypt_payload(&body)])
}

/// Decode a datagram sent by a client, as a device would.
#[cfg(test)]
pub(crate) fn decode_request(bytes: &[u8]) -> Result<Request, DecodeError> {
    if bytes.len() > 12 && bytes[0..4] == DISCOVERY_REQUEST && bytes[4..12] == [0u8; 8] {
        let pattern = &bytes[12..];
        let len = pattern
            .iter()
            .position(|b| *b == 0x00)
            .unwrap_or_else(|| pattern.len());
        let pattern = std::str::from_utf8(&pattern[..len])
            .map_err(|_| DecodeError::new("pattern is not ASCII"))?;
        return Ok(Request::Discovery {
            pattern: pattern.to_string(),
        });
    }

    let (header, payloads) = parse_header(bytes)?;
    match header.packet_type {
        PACKET_CONNECT => {
            let body = find_payload(payloads, PAYLOAD_CP_ID)?;
            let mut reader = Reader::new(body);
            if reader.u8("identity type")? != CP_ID_EMAIL {
                return Err(DecodeError::new("unsupported identity type"));
            }
            let email = std::str::from_utf8(&body[1..])
                .map_err(|_| DecodeError::new("email is not UTF-8"))?;
            Ok(Request::Connect {
                client_id: header.ids.client_id,
                email: email.to_string(),
            })
        }
        PACKET_DATA => {
            let body = crypt_body(payloads)?;
            let mut reader = Reader::new(body);
            match reader.u8("command")? {
                CMD_DATAPOINTS => Ok(Request::Data {
                    ids: header.ids,
                    code: reader.u16("request code")?,
                }),
                CMD_SETPOINTS => Ok(Request::SetpointState {
                    ids: header.ids,
                    code: reader.u16("request code")?,
                }),
                CMD_SETPOINT_WRITE => {
                    let count = reader.u16("entry count")?;
                    if count != 1 {
                        return Err(DecodeError::new(format!("unexpected entry count {}", count)));
                    }
                    let address = reader.u16("entry")?;
                    let raw = reader.i16("entry")?;
                    Ok(Request::SetpointWrite {
                        ids: header.ids,
                        key: SetpointKey::from_address(address),
                        raw,
                    })
                }
                other => Err(DecodeError::new(format!("unsupported command 0x{:02X}", other))),
            }
        }
        other => Err(DecodeError::new(format!("unsupported packet type 0x{:02X}", other))),
    }
}

/// Decode a setpoint write into its key and value at native scale.
#[cfg(test)]
pub(crate) fn decode_setpoint_write(bytes: &[u8]) -> Result<(SetpointKey, f64), DecodeError> {
    match decode_request(bytes)? {
        Request::SetpointWrite {
            key: Some(key),
            raw,
            ..
        } => Ok((key, key.info().from_raw(raw))),
        Request::SetpointWrite { key: None, .. } => {
            Err(DecodeError::new("unknown setpoint address"))
        }
        _ => Err(DecodeError::new("not a setpoint write")),
    }
}
