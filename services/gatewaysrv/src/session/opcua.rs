//! OPC UA field-protocol client
//!
//! Wraps an `opcua` client session: endpoint discovery against the device's
//! configured URL, an anonymous unencrypted session, and a background task
//! driving the session event loop until the session is dropped. Addresses are
//! node id strings (`ns=2;s=Demo.Temperature`).

use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use opcua::client::{ClientBuilder, IdentityToken, Session, SessionPollResult};
use opcua::types::{DataValue, MessageSecurityMode, NodeId, ReadValueId, TimestampsToReturn, Variant};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GatewaySrvError, Result};
use crate::model::{DataType, FieldValue};
use crate::session::driver::{FieldClient, ReadRequest};

pub struct OpcUaClient {
    url: String,
    session: Option<Arc<Session>>,
    cancel: CancellationToken,
}

impl OpcUaClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            session: None,
            cancel: CancellationToken::new(),
        }
    }

    fn to_field_value(dv: &DataValue, data_type: DataType) -> Option<FieldValue> {
        if let Some(status) = dv.status {
            if !status.is_good() {
                warn!(status = %status, "OPC UA read returned bad status");
                return None;
            }
        }
        let variant = dv.value.as_ref()?;
        let value = match variant {
            Variant::Boolean(b) => FieldValue::Bool(*b),
            Variant::SByte(v) => FieldValue::Int(*v as i64),
            Variant::Byte(v) => FieldValue::UInt(*v as u64),
            Variant::Int16(v) => FieldValue::Int(*v as i64),
            Variant::UInt16(v) => FieldValue::UInt(*v as u64),
            Variant::Int32(v) => FieldValue::Int(*v as i64),
            Variant::UInt32(v) => FieldValue::UInt(*v as u64),
            Variant::Int64(v) => FieldValue::Int(*v),
            Variant::UInt64(v) => FieldValue::UInt(*v),
            Variant::Float(v) => FieldValue::Float(*v as f64),
            Variant::Double(v) => FieldValue::Float(*v),
            Variant::String(s) => FieldValue::Text(s.value().clone().unwrap_or_default()),
            other => {
                // Unexpected runtime type: fall back to the debug string form
                warn!(data_type = ?data_type, "Unexpected OPC UA variant {other:?}");
                FieldValue::Text(format!("{other:?}"))
            }
        };
        Some(value)
    }
}

#[async_trait]
impl FieldClient for OpcUaClient {
    async fn connect(&mut self) -> Result<()> {
        let mut client = ClientBuilder::new()
            .application_name("gatewaysrv")
            .application_uri("urn:gatewaysrv")
            .pki_dir("./pki")
            .session_retry_limit(0)
            .trust_server_certs(false)
            .create_sample_keypair(false)
            .client()
            .map_err(|e| GatewaySrvError::connection(format!("OPC UA client build: {e:?}")))?;

        let url = self.url.trim();
        let endpoints = client
            .get_server_endpoints_from_url(url)
            .await
            .map_err(|e| GatewaySrvError::connection(format!("OPC UA endpoint discovery: {e}")))?;

        let endpoint = endpoints
            .into_iter()
            .find(|ep| ep.security_mode == MessageSecurityMode::None)
            .ok_or_else(|| {
                GatewaySrvError::connection(format!("no unencrypted OPC UA endpoint at {url}"))
            })?;

        let (session, event_loop) = client
            .connect_to_endpoint_directly(endpoint, IdentityToken::Anonymous)
            .map_err(|e| GatewaySrvError::connection(format!("OPC UA connect: {e}")))?;

        // Drive the event loop in the background; the watch channel reports
        // the first successful transport activation back to this call.
        let (ready_tx, mut ready_rx) = watch::channel(false);
        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let loop_session = Arc::clone(&session);
        tokio::spawn(async move {
            let stream = event_loop.enter();
            pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tokio::time::timeout(
                            Duration::from_secs(2),
                            loop_session.disconnect(),
                        )
                        .await;
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(SessionPollResult::Transport(_)))
                        | Some(Ok(SessionPollResult::Reconnected(_))) => {
                            let _ = ready_tx.send(true);
                        }
                        Some(Ok(SessionPollResult::ConnectionLost(status))) => {
                            warn!(status = %status, "OPC UA connection lost");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(status)) => {
                            warn!(status = %status, "OPC UA event loop error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        // The session manager bounds this whole call with its own connect
        // timeout; waiting here only converts "never activated" into an error.
        ready_rx
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| GatewaySrvError::connection("OPC UA session closed before activation"))?;

        debug!(url = %self.url, "OPC UA session established");
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.session = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn read_batch(
        &mut self,
        requests: &[ReadRequest],
    ) -> Result<HashMap<String, FieldValue>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| GatewaySrvError::connection("OPC UA session not connected"))?;

        let mut readable = Vec::with_capacity(requests.len());
        let mut nodes_to_read = Vec::with_capacity(requests.len());
        for request in requests {
            match NodeId::from_str(&request.address) {
                Ok(id) => {
                    readable.push(request);
                    nodes_to_read.push(ReadValueId::new_value(id));
                }
                Err(_) => {
                    warn!(address = %request.address, "Skipping invalid OPC UA node id")
                }
            }
        }
        if nodes_to_read.is_empty() {
            return Ok(HashMap::new());
        }

        let results = session
            .read(&nodes_to_read, TimestampsToReturn::Both, 0.0)
            .await
            .map_err(|status| {
                GatewaySrvError::protocol(format!("OPC UA read failed: {status}"))
            })?;

        let mut values = HashMap::with_capacity(results.len());
        for (request, dv) in readable.iter().zip(results.iter()) {
            if let Some(value) = Self::to_field_value(dv, request.data_type) {
                values.insert(request.address.clone(), value);
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_conversion_covers_scalar_types() {
        let dv = DataValue::new_now(Variant::Double(2.25));
        assert_eq!(
            OpcUaClient::to_field_value(&dv, DataType::Float64),
            Some(FieldValue::Float(2.25))
        );

        let dv = DataValue::new_now(Variant::Boolean(true));
        assert_eq!(
            OpcUaClient::to_field_value(&dv, DataType::Bool),
            Some(FieldValue::Bool(true))
        );

        let dv = DataValue::new_now(Variant::Int32(-7));
        assert_eq!(
            OpcUaClient::to_field_value(&dv, DataType::Int32),
            Some(FieldValue::Int(-7))
        );
    }
}
