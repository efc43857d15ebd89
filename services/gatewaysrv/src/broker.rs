//! MQTT broker connection management
//!
//! Mirrors the device session manager for the northbound side: one context
//! per configured broker, bounded-concurrency connects, and template-driven
//! payload construction. There is no outbound durability: publishing to a
//! disconnected broker drops the message and logs it.

use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GatewaySrvError, Result};
use crate::events::{NotificationHub, ServerChanged, ServerProperty};
use crate::model::{MessageTemplate, MqttAlias, MqttServer};
use crate::registry::Registry;

/// Substitute the broker template's placeholders and concatenate
/// header + content + footer.
pub fn render_payload(
    template: &MessageTemplate,
    alias: &str,
    value: &str,
    timestamp_ms: i64,
) -> String {
    let raw = format!("{}{}{}", template.header, template.content, template.footer);
    raw.replace("{timestamp}", &timestamp_ms.to_string())
        .replace("{name}", alias)
        .replace("{value}", value)
}

struct BrokerContext {
    server_id: u32,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    event_task: JoinHandle<()>,
}

impl Drop for BrokerContext {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

/// Connection manager for all configured MQTT brokers
pub struct MqttManager {
    contexts: DashMap<u32, Arc<BrokerContext>>,
    connect_permits: Arc<Semaphore>,
    registry: Arc<Registry>,
    hub: Arc<NotificationHub>,
}

impl MqttManager {
    pub fn new(registry: Arc<Registry>, hub: Arc<NotificationHub>, connect_limit: usize) -> Self {
        Self {
            contexts: DashMap::new(),
            connect_permits: Arc::new(Semaphore::new(connect_limit)),
            registry,
            hub,
        }
    }

    pub fn is_connected(&self, server_id: u32) -> bool {
        self.contexts
            .get(&server_id)
            .map(|c| c.connected.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Connect every active broker from the registry, bounded by the connect
    /// semaphore. Per-broker failures are logged and isolated.
    pub async fn connect_all(&self) {
        let servers = self.registry.servers();
        let active: Vec<MqttServer> = servers.into_iter().filter(|s| s.active).collect();
        if active.is_empty() {
            return;
        }
        info!("Connecting {} MQTT brokers", active.len());
        let tasks = active.into_iter().map(|server| async move {
            if let Err(e) = self.connect(&server).await {
                warn!(server_id = server.id, "Broker connect failed: {e}");
            }
        });
        futures::future::join_all(tasks).await;
    }

    /// Open (or replace) the client session for one broker
    pub async fn connect(&self, server: &MqttServer) -> Result<()> {
        let _permit = self
            .connect_permits
            .acquire()
            .await
            .map_err(|_| GatewaySrvError::internal("broker semaphore closed"))?;

        // Drop any previous context for this broker id
        self.contexts.remove(&server.id);

        // A broker without a configured client id gets a random one so two
        // gateways against the same broker cannot evict each other's session
        let client_id = if server.client_id.is_empty() {
            format!("gatewaysrv-{:08x}", rand::random::<u32>())
        } else {
            server.client_id.clone()
        };
        let mut options = MqttOptions::new(client_id, &server.host, server.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&server.username, &server.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&connected);
        let registry = Arc::clone(&self.registry);
        let hub = Arc::clone(&self.hub);
        let server_id = server.id;
        let event_task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if !flag.swap(true, Ordering::AcqRel) {
                            registry.set_server_connection(server_id, true);
                            hub.server_changed(ServerChanged {
                                server_id,
                                property: ServerProperty::Connection,
                                connected: true,
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(server_id, "MQTT event loop error: {e}");
                        if flag.swap(false, Ordering::AcqRel) {
                            registry.set_server_connection(server_id, false);
                            hub.server_changed(ServerChanged {
                                server_id,
                                property: ServerProperty::Connection,
                                connected: false,
                            });
                        }
                        break;
                    }
                }
            }
        });

        if !server.subscribe_topic.is_empty() {
            client
                .subscribe(&server.subscribe_topic, QoS::AtMostOnce)
                .await
                .map_err(|e| GatewaySrvError::connection(format!("MQTT subscribe: {e}")))?;
            debug!(server_id = server.id, topic = %server.subscribe_topic, "Subscribed");
        }

        self.contexts.insert(
            server.id,
            Arc::new(BrokerContext {
                server_id: server.id,
                client,
                connected,
                event_task,
            }),
        );
        info!(server_id = server.id, host = %server.host, "MQTT broker session opened");
        Ok(())
    }

    /// Idempotent disconnect of one broker
    pub async fn disconnect(&self, server_id: u32) {
        if let Some((_, context)) = self.contexts.remove(&server_id) {
            let _ = context.client.disconnect().await;
            if context.connected.swap(false, Ordering::AcqRel) {
                self.registry.set_server_connection(server_id, false);
                self.hub.server_changed(ServerChanged {
                    server_id,
                    property: ServerProperty::Connection,
                    connected: false,
                });
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<u32> = self.contexts.iter().map(|c| c.server_id).collect();
        for id in ids {
            self.disconnect(id).await;
        }
    }

    /// Publish one alias's current value through its broker.
    ///
    /// Dropped (with a log line) when the broker is not connected; there is
    /// no queueing and no redelivery.
    pub async fn publish(&self, alias: &MqttAlias) -> Result<()> {
        let server = self.registry.server(alias.server_id).ok_or_else(|| {
            GatewaySrvError::config(format!("alias references unknown server {}", alias.server_id))
        })?;
        let Some(context) = self.contexts.get(&alias.server_id).map(|c| Arc::clone(&c)) else {
            warn!(
                server_id = alias.server_id,
                alias = %alias.alias,
                "Dropping publish: no broker session"
            );
            return Ok(());
        };
        if !context.connected.load(Ordering::Acquire) {
            warn!(
                server_id = alias.server_id,
                alias = %alias.alias,
                "Dropping publish: broker not connected"
            );
            return Ok(());
        }

        let value = self
            .registry
            .variable(alias.variable_id)
            .and_then(|v| v.last_value)
            .unwrap_or_default();
        let payload = render_payload(
            &server.template,
            &alias.alias,
            &value,
            chrono::Utc::now().timestamp_millis(),
        );
        context
            .client
            .publish(&server.publish_topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| GatewaySrvError::io(format!("MQTT publish: {e}")))?;
        Ok(())
    }

    /// Publish a list of aliases grouped by broker, in broker-id order. A
    /// broker-level failure aborts only that broker's group.
    pub async fn publish_batch(&self, aliases: &[MqttAlias]) {
        let mut by_server: BTreeMap<u32, Vec<&MqttAlias>> = BTreeMap::new();
        for alias in aliases {
            by_server.entry(alias.server_id).or_default().push(alias);
        }
        for (server_id, group) in by_server {
            for alias in group {
                if let Err(e) = self.publish(alias).await {
                    warn!(server_id, "Aborting broker group after publish failure: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_substitution() {
        let template = MessageTemplate {
            header: "{timestamp}".into(),
            content: "{name}:{value}".into(),
            footer: String::new(),
        };
        let payload = render_payload(&template, "tempA", "23.5", 1700000000123);
        assert_eq!(payload, "1700000000123tempA:23.5");
    }

    #[test]
    fn placeholders_survive_in_any_section() {
        let template = MessageTemplate {
            header: "<{name}>".into(),
            content: "{value}".into(),
            footer: "@{timestamp}".into(),
        };
        assert_eq!(
            render_payload(&template, "p1", "7", 42),
            "<p1>7@42"
        );
    }
}
