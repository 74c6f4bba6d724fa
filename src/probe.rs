//! The two end-to-end procedures the polling and service layers call.
//!
//! Neither procedure returns an error: every failure is captured in the
//! report's `connection_error` code, and the client is closed on every path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use log::{debug, info, warn};

use serde::Serialize;

use crate::{
    client::DeviceClient,
    config::{ClientConfig, GatewayConfig},
    error::{Error, Result},
    keys::{SetpointKey, SetpointRange},
    session::{SetpointState, Target},
};

/// How the device of a report was selected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectedDevice {
    /// Manually configured address.
    ManualIp {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
    },
    /// Explicitly configured device id.
    DeviceId {
        /// Configured device id.
        device_id: String,
        /// Whether discovery found it.
        found: bool,
    },
    /// First discovered device.
    FirstDiscovered {
        /// Device id of the selected device.
        device_id: String,
        /// Host it was discovered at.
        host: String,
        /// Port it was discovered at.
        port: u16,
    },
}

/// Result of `run_probe`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    /// Always `"nabto-probe"`.
    pub mode: &'static str,
    /// Time the probe started.
    pub timestamp_utc: DateTime<Utc>,
    /// Whether the probe connected and received data.
    pub ok: bool,
    /// Failure code, `None` if `ok`.
    pub connection_error: Option<String>,
    /// The selected device.
    pub selected_device: Option<SelectedDevice>,
    /// All discovered devices as `(host, port)`.
    pub discovered_devices: BTreeMap<String, (String, u16)>,
    /// Datapoint values by key name.
    pub datapoints: BTreeMap<String, f64>,
    /// Setpoints with bounds by key name.
    pub setpoints: BTreeMap<String, SetpointState>,
}

/// Result of `run_setpoint_write`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetpointReport {
    /// Always `"nabto-setpoint"`.
    pub mode: &'static str,
    /// Time the write started.
    pub timestamp_utc: DateTime<Utc>,
    /// Whether the write was verified.
    pub ok: bool,
    /// Failure code, `None` if `ok`.
    pub connection_error: Option<String>,
    /// The selected device.
    pub selected_device: Option<SelectedDevice>,
    /// The setpoint key as requested.
    pub key: String,
    /// The requested value.
    pub requested_value: f64,
    /// The value before the write.
    pub before_value: Option<f64>,
    /// The value read back after the write.
    pub readback_value: Option<f64>,
    /// The device reported bounds.
    pub range: Option<SetpointRange>,
}

#[derive(Debug, Default)]
struct Selection {
    selected_device: Option<SelectedDevice>,
    discovered_devices: BTreeMap<String, (String, u16)>,
}

impl Selection {
    fn update_discovered(&mut self, client: &DeviceClient) {
        self.discovered_devices = client
            .discovered_devices()
            .into_iter()
            .map(|(id, addr)| (id, (addr.ip().to_string(), addr.port())))
            .collect();
    }
}

async fn select(
    client: &mut DeviceClient,
    gateway: &GatewayConfig,
    selection: &mut Selection,
) -> Result<()> {
    if let Some(addr) = gateway.manual_addr().await? {
        selection.selected_device = Some(SelectedDevice::ManualIp {
            host: gateway.host.clone().unwrap_or_default(),
            port: gateway.port,
        });
        client.select_manual(addr).await?;
    } else if let Some(device_id) = &gateway.device_id {
        selection.selected_device = Some(SelectedDevice::DeviceId {
            device_id: device_id.clone(),
            found: false,
        });
        let result = client.select_device_id(device_id).await;
        selection.update_discovered(client);
        result?;
        selection.selected_device = Some(SelectedDevice::DeviceId {
            device_id: device_id.clone(),
            found: true,
        });
    } else {
        let result = client.discover(true).await;
        selection.update_discovered(client);
        result?;

        let target = client.select_first_discovered().await?;
        if let Target::FirstDiscovered { device_id, addr } = target {
            selection.selected_device = Some(SelectedDevice::FirstDiscovered {
                device_id,
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        }
    }

    Ok(())
}

fn no_data_error(connection_error: Option<String>) -> Error {
    match connection_error {
        Some(code) => Error::SessionFailed(code),
        None => Error::DataTimeout,
    }
}

async fn establish(
    client: &mut DeviceClient,
    gateway: &GatewayConfig,
    selection: &mut Selection,
) -> Result<()> {
    select(client, gateway, selection).await?;

    let config = client.config().clone();
    client.connect().await?;
    client.wait_for_connection(config.connect_timeout).await?;

    if !client.wait_for_data(config.data_timeout).await {
        return Err(no_data_error(client.connection_error()));
    }

    // setpoints travel in their own frame right after the datapoints
    client.wait_for_setpoints(config.settle_delay).await;

    Ok(())
}

/// Connect to the configured device and report all values it provides.
pub async fn run_probe(gateway: &GatewayConfig, config: &ClientConfig) -> ProbeReport {
    let timestamp_utc = Utc::now();
    let mut client = DeviceClient::new(gateway.email.clone(), config.clone());
    let mut selection = Selection::default();

    let result = establish(&mut client, gateway, &mut selection).await;

    let datapoints = client
        .datapoints()
        .into_iter()
        .map(|(key, value)| (key.name().to_string(), value))
        .collect();
    let setpoints = client
        .setpoints()
        .into_iter()
        .filter(|(_, state)| state.value.is_some())
        .map(|(key, state)| (key.name().to_string(), state))
        .collect();

    client.close().await;

    let connection_error = match result {
        Ok(()) => {
            info!("Probe succeeded");
            None
        }
        Err(err) => {
            warn!("Probe failed: {}", err);
            Some(err.code())
        }
    };

    ProbeReport {
        mode: "nabto-probe",
        timestamp_utc,
        ok: connection_error.is_none(),
        connection_error,
        selected_device: selection.selected_device,
        discovered_devices: selection.discovered_devices,
        datapoints,
        setpoints,
    }
}

#[derive(Debug, Default)]
struct WriteOutcome {
    before_value: Option<f64>,
    readback_value: Option<f64>,
    range: Option<SetpointRange>,
}

async fn write(
    client: &mut DeviceClient,
    gateway: &GatewayConfig,
    selection: &mut Selection,
    key: &str,
    value: f64,
    outcome: &mut WriteOutcome,
) -> Result<()> {
    let key = key.parse::<SetpointKey>()?;

    establish(client, gateway, selection).await?;

    outcome.before_value = client.get_value(key);
    outcome.range = client.get_setpoint_bounds(key);
    debug!("{} is {:?}, range {:?}", key, outcome.before_value, outcome.range);

    match client.set_setpoint(key, value).await {
        Ok(readback) => {
            outcome.readback_value = Some(readback);
            Ok(())
        }
        Err(err) => {
            if let Error::ReadbackMismatch { observed, .. } = &err {
                outcome.readback_value = *observed;
            }
            Err(err)
        }
    }
}

/// Connect to the configured device, write one setpoint and verify it.
pub async fn run_setpoint_write(
    gateway: &GatewayConfig,
    config: &ClientConfig,
    key: &str,
    value: f64,
) -> SetpointReport {
    let timestamp_utc = Utc::now();
    let mut client = DeviceClient::new(gateway.email.clone(), config.clone());
    let mut selection = Selection::default();
    let mut outcome = WriteOutcome::default();

    let result = write(&mut client, gateway, &mut selection, key, value, &mut outcome).await;

    client.close().await;

    let connection_error = match result {
        Ok(()) => {
            info!("Setpoint {} set to {}", key, value);
            None
        }
        Err(err) => {
            warn!("Setpoint write of {} failed: {}", key, err);
            Some(err.code())
        }
    };

    SetpointReport {
        mode: "nabto-setpoint",
        timestamp_utc,
        ok: connection_error.is_none(),
        connection_error,
        selected_device: selection.selected_device,
        key: key.to_string(),
        requested_value: value,
        before_value: outcome.before_value,
        readback_value: outcome.readback_value,
        range: outcome.range,
    }
}
