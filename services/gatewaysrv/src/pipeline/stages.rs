//! The built-in pipeline stages

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::MqttManager;
use crate::error::Result;
use crate::events::{AlarmBound, AlarmRaised, NotificationHub, ValueChanged};
use crate::history::HistoryWriter;
use crate::model::VariableHistory;
use crate::pipeline::{StageKind, UpdateContext, UpdatePipeline, UpdateStage};
use crate::registry::Registry;
use crate::trigger::TriggerEngine;

/// Assemble a pipeline from the configured stage order
pub fn build_pipeline(
    order: &[StageKind],
    registry: Arc<Registry>,
    hub: Arc<NotificationHub>,
    mqtt: Arc<MqttManager>,
    triggers: Arc<TriggerEngine>,
    history: Arc<HistoryWriter>,
) -> UpdatePipeline {
    let stages = order
        .iter()
        .map(|kind| -> Arc<dyn UpdateStage> {
            match kind {
                StageKind::Convert => Arc::new(ConvertStage {
                    registry: Arc::clone(&registry),
                }),
                StageKind::Alarm => Arc::new(AlarmStage {
                    hub: Arc::clone(&hub),
                }),
                StageKind::Trigger => Arc::new(TriggerStage {
                    engine: Arc::clone(&triggers),
                }),
                StageKind::Publish => Arc::new(PublishStage {
                    registry: Arc::clone(&registry),
                    mqtt: Arc::clone(&mqtt),
                }),
                StageKind::History => Arc::new(HistoryStage {
                    writer: Arc::clone(&history),
                }),
                StageKind::Notify => Arc::new(NotifyStage {
                    hub: Arc::clone(&hub),
                }),
            }
        })
        .collect();
    UpdatePipeline::new(stages)
}

/// Converts the raw protocol value into its canonical string and numeric
/// forms and applies the system's sole deduplication gate: when the canonical
/// string equals the previous value, the chain short-circuits. The deadband
/// thresholds configured on the variable are intentionally not consulted
/// here; exact equality is the only criterion.
pub struct ConvertStage {
    pub registry: Arc<Registry>,
}

#[async_trait]
impl UpdateStage for ConvertStage {
    fn name(&self) -> &'static str {
        "convert"
    }

    async fn process(&self, ctx: &mut UpdateContext) -> Result<()> {
        ctx.value = ctx.raw.canonical_string();
        ctx.numeric = ctx.raw.as_f64();

        if ctx.variable.last_value.as_deref() == Some(ctx.value.as_str()) {
            debug!(
                variable_id = ctx.variable.id,
                "Value unchanged, short-circuiting"
            );
            ctx.handled = true;
            return Ok(());
        }

        self.registry.update_value(
            ctx.variable.id,
            ctx.raw.canonical_string(),
            ctx.value.clone(),
            ctx.numeric,
        );
        // Later stages see the refreshed snapshot
        ctx.variable.last_raw = Some(ctx.raw.canonical_string());
        ctx.variable.last_value = Some(ctx.value.clone());
        ctx.variable.last_numeric = ctx.numeric;
        Ok(())
    }
}

/// Evaluates the variable's alarm bounds and raises an alarm notification.
/// Never short-circuits.
pub struct AlarmStage {
    pub hub: Arc<NotificationHub>,
}

#[async_trait]
impl UpdateStage for AlarmStage {
    fn name(&self) -> &'static str {
        "alarm"
    }

    async fn process(&self, ctx: &mut UpdateContext) -> Result<()> {
        if !ctx.variable.alarm_enabled {
            return Ok(());
        }
        let Some(value) = ctx.numeric else {
            return Ok(());
        };
        let breached = match (ctx.variable.alarm_min, ctx.variable.alarm_max) {
            (Some(min), _) if value < min => Some(AlarmBound::Min(min)),
            (_, Some(max)) if value > max => Some(AlarmBound::Max(max)),
            _ => None,
        };
        if let Some(bound) = breached {
            self.hub.alarm_raised(AlarmRaised {
                variable_id: ctx.variable.id,
                value,
                bound,
            });
        }
        Ok(())
    }
}

/// Delegates to the trigger engine; evaluation errors are contained inside
/// the engine and never short-circuit the chain.
pub struct TriggerStage {
    pub engine: Arc<TriggerEngine>,
}

#[async_trait]
impl UpdateStage for TriggerStage {
    fn name(&self) -> &'static str {
        "trigger"
    }

    async fn process(&self, ctx: &mut UpdateContext) -> Result<()> {
        self.engine.evaluate(&ctx.variable, ctx.numeric).await;
        Ok(())
    }
}

/// Publishes the new value through every active alias whose broker is
/// active; per-alias failures are isolated.
pub struct PublishStage {
    pub registry: Arc<Registry>,
    pub mqtt: Arc<MqttManager>,
}

#[async_trait]
impl UpdateStage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn process(&self, ctx: &mut UpdateContext) -> Result<()> {
        let aliases = self.registry.aliases_for_variable(ctx.variable.id);
        for alias in aliases {
            let server_active = self
                .registry
                .server(alias.server_id)
                .map(|s| s.active)
                .unwrap_or(false);
            if !server_active {
                continue;
            }
            if let Err(e) = self.mqtt.publish(&alias).await {
                warn!(
                    variable_id = ctx.variable.id,
                    server_id = alias.server_id,
                    "Alias publish failed: {e}"
                );
            }
        }
        Ok(())
    }
}

/// Enqueues a history row when history is enabled on the variable
pub struct HistoryStage {
    pub writer: Arc<HistoryWriter>,
}

#[async_trait]
impl UpdateStage for HistoryStage {
    fn name(&self) -> &'static str {
        "history"
    }

    async fn process(&self, ctx: &mut UpdateContext) -> Result<()> {
        if ctx.variable.history_enabled {
            self.writer.enqueue(VariableHistory {
                variable_id: ctx.variable.id,
                value: ctx.value.clone(),
                timestamp: ctx.timestamp,
            });
        }
        Ok(())
    }
}

/// Raises the value-changed notification consumed by the presentation layer
pub struct NotifyStage {
    pub hub: Arc<NotificationHub>,
}

#[async_trait]
impl UpdateStage for NotifyStage {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn process(&self, ctx: &mut UpdateContext) -> Result<()> {
        self.hub.value_changed(ValueChanged {
            variable_id: ctx.variable.id,
            value: ctx.value.clone(),
            timestamp: ctx.timestamp,
        });
        Ok(())
    }
}
