use std::{collections::BTreeMap, sync::Arc};

use async_std::sync::Mutex as AsyncMutex;

use log::{debug, info};

use parking_lot::Mutex;

use serde::Deserialize;

use crate::{
    config::{ClientConfig, GatewayConfig},
    error::{Error, Result},
    keys::Key,
    probe::{run_probe, run_setpoint_write, ProbeReport, SetpointReport},
};

/// One configured device as seen by the polling scheduler and the service layer.
///
/// At most one refresh or setpoint write runs at a time per gateway.
#[derive(Debug)]
pub struct Gateway {
    id: String,
    config: GatewayConfig,
    client_config: ClientConfig,
    busy: AsyncMutex<()>,
    last_report: Mutex<Option<ProbeReport>>,
}

impl Gateway {
    /// Create a new `Gateway`.
    pub fn new<S: Into<String>>(
        id: S,
        config: GatewayConfig,
        client_config: ClientConfig,
    ) -> Gateway {
        Gateway {
            id: id.into(),
            config,
            client_config,
            busy: AsyncMutex::new(()),
            last_report: Mutex::new(None),
        }
    }

    /// The target id used by service calls.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The gateway's configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Probe the device and cache the report.
    ///
    /// A failed probe keeps the previous report and yields
    /// `Error::UpdateFailed` carrying the report's code.
    pub async fn refresh(&self) -> Result<ProbeReport> {
        let _busy = self.busy.lock().await;

        debug!("Refreshing {}", self.id);
        let report = run_probe(&self.config, &self.client_config).await;

        match &report.connection_error {
            None => {
                *self.last_report.lock() = Some(report.clone());
                Ok(report)
            }
            Some(code) => Err(Error::UpdateFailed(code.clone())),
        }
    }

    /// Write a setpoint with readback verification.
    pub async fn set_setpoint(&self, key: &str, value: f64) -> Result<SetpointReport> {
        let _busy = self.busy.lock().await;

        info!("Setting {} of {} to {}", key, self.id, value);
        let report = run_setpoint_write(&self.config, &self.client_config, key, value).await;

        match &report.connection_error {
            None => Ok(report),
            Some(code) => Err(Error::SetpointFailed {
                key: key.to_string(),
                code: code.clone(),
            }),
        }
    }

    /// The last successful probe report.
    pub fn last_report(&self) -> Option<ProbeReport> {
        self.last_report.lock().clone()
    }

    /// The value of a key in the last successful probe report.
    pub fn last_value<K: Into<Key>>(&self, key: K) -> Option<f64> {
        let key = key.into();
        let report = self.last_report.lock();
        let report = report.as_ref()?;
        match key {
            Key::Datapoint(key) => report.datapoints.get(key.name()).copied(),
            Key::Setpoint(key) => report.setpoints.get(key.name()).and_then(|state| state.value),
        }
    }
}

/// Arguments of the external setpoint write service call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetpointCall {
    /// Setpoint key name.
    pub key: String,
    /// Requested value.
    pub value: f64,
    /// Gateway to write to, may be omitted if only one is configured.
    #[serde(default)]
    pub target_id: Option<String>,
}

/// All configured gateways by target id.
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    gateways: BTreeMap<String, Arc<Gateway>>,
}

impl GatewayRegistry {
    /// Create an empty registry.
    pub fn new() -> GatewayRegistry {
        GatewayRegistry::default()
    }

    /// Add a gateway, replacing one with the same id.
    pub fn insert(&mut self, gateway: Gateway) -> Arc<Gateway> {
        let gateway = Arc::new(gateway);
        self.gateways
            .insert(gateway.id().to_string(), gateway.clone());
        gateway
    }

    /// Remove a gateway.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Gateway>> {
        self.gateways.remove(id)
    }

    /// Look up a gateway by id.
    pub fn get(&self, id: &str) -> Option<Arc<Gateway>> {
        self.gateways.get(id).cloned()
    }

    /// Resolve a service call target.
    ///
    /// Without an id the only configured gateway is used.
    pub fn resolve(&self, target_id: Option<&str>) -> Result<Arc<Gateway>> {
        match target_id {
            Some(id) => self
                .get(id)
                .ok_or_else(|| Error::NoSuchTarget(id.to_string())),
            None => {
                let mut gateways = self.gateways.values();
                match (gateways.next(), gateways.next()) {
                    (Some(gateway), None) => Ok(gateway.clone()),
                    _ => Err(Error::NoSuchTarget(format!(
                        "{} gateways configured, target id required",
                        self.gateways.len()
                    ))),
                }
            }
        }
    }

    /// Handle the external setpoint write service call.
    pub async fn handle_set_setpoint(&self, call: &SetpointCall) -> Result<SetpointReport> {
        let gateway = self.resolve(call.target_id.as_deref())?;
        gateway.set_setpoint(&call.key, call.value).await
    }
}
