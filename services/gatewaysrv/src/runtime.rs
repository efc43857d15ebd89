//! Runtime orchestration
//!
//! Wires the registry, session managers, pipeline, trigger engine and history
//! writer together, owns the background tasks, and drives graceful shutdown.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::MqttManager;
use crate::config::AppConfig;
use crate::error::Result;
use crate::events::NotificationHub;
use crate::history::HistoryWriter;
use crate::pipeline::stages::build_pipeline;
use crate::registry::Registry;
use crate::scheduler::PollScheduler;
use crate::session::DeviceManager;
use crate::storage::{ConfigStore, HistoryStore};
use crate::trigger::{ActionDispatcher, HttpActionDispatcher, TriggerEngine};

/// The assembled gateway service
pub struct Gateway {
    pub registry: Arc<Registry>,
    pub hub: Arc<NotificationHub>,
    pub devices: Arc<DeviceManager>,
    pub mqtt: Arc<MqttManager>,
    pub triggers: Arc<TriggerEngine>,
    history: Arc<HistoryWriter>,
    token: CancellationToken,
    scheduler_task: JoinHandle<()>,
    broker_task: JoinHandle<()>,
}

impl Gateway {
    /// Construct all components and start the background loops. The service
    /// stays idle until the first registry load signals a reload.
    pub fn start(config: &AppConfig, history_store: Arc<dyn HistoryStore>) -> Self {
        Self::start_with_dispatcher(config, history_store, Arc::new(HttpActionDispatcher::new()))
    }

    pub fn start_with_dispatcher(
        config: &AppConfig,
        history_store: Arc<dyn HistoryStore>,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Self {
        let token = CancellationToken::new();
        let registry = Arc::new(Registry::new());
        let hub = Arc::new(NotificationHub::new());

        let devices = Arc::new(DeviceManager::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            config.poll.connect_limit,
            config.connect_timeout(),
        ));
        let mqtt = Arc::new(MqttManager::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            config.broker.connect_limit,
        ));
        let triggers = Arc::new(TriggerEngine::new(Arc::clone(&registry), dispatcher));
        let history = HistoryWriter::spawn(
            history_store,
            config.history.batch_size,
            config.flush_interval(),
            token.child_token(),
        );
        let history = Arc::new(history);

        let pipeline = Arc::new(build_pipeline(
            &config.pipeline.stages,
            Arc::clone(&registry),
            Arc::clone(&hub),
            Arc::clone(&mqtt),
            Arc::clone(&triggers),
            Arc::clone(&history),
        ));

        let scheduler_task = PollScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&devices),
            pipeline,
            config.poll_quantum(),
            token.child_token(),
            hub.subscribe_reloaded(),
        )
        .spawn();

        // Broker manager reacts to the same reload signal as the scheduler
        let broker_task = {
            let mqtt = Arc::clone(&mqtt);
            let mut reload_rx = hub.subscribe_reloaded();
            let broker_token = token.child_token();
            tokio::spawn(async move {
                loop {
                    use tokio::sync::broadcast::error::RecvError;
                    tokio::select! {
                        _ = broker_token.cancelled() => break,
                        signal = reload_rx.recv() => match signal {
                            Ok(()) | Err(RecvError::Lagged(_)) => mqtt.connect_all().await,
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
                mqtt.disconnect_all().await;
            })
        };

        Self {
            registry,
            hub,
            devices,
            mqtt,
            triggers,
            history,
            token,
            scheduler_task,
            broker_task,
        }
    }

    /// Bulk-load all configuration from the store and fire the reload signal
    pub async fn load_from_store(&self, store: &ConfigStore) -> Result<()> {
        self.registry.load_devices(store.load_devices().await?);
        self.registry.load_tables(store.load_tables().await?);
        self.registry.load_variables(store.load_variables().await?);
        self.registry.load_servers(store.load_servers().await?);
        self.registry.load_aliases(store.load_aliases().await?);
        let (triggers, bindings) = store.load_triggers().await?;
        self.registry.load_triggers(triggers, bindings);
        info!("Configuration loaded, signalling reload");
        self.hub.registry_reloaded();
        Ok(())
    }

    /// Cancel all background loops and wait for an orderly stop: the
    /// scheduler disconnects its devices, the broker task closes its
    /// sessions, and the history writer performs its final flush.
    pub async fn shutdown(self) {
        info!("Shutting down gateway");
        self.token.cancel();
        if let Err(e) = self.scheduler_task.await {
            warn!("Scheduler task join error: {e}");
        }
        if let Err(e) = self.broker_task.await {
            warn!("Broker task join error: {e}");
        }
        self.history.join().await;
        info!("Gateway stopped");
    }
}
