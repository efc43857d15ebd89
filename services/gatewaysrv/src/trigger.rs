//! Trigger evaluation and action dispatch
//!
//! For each new value, the engine walks the active triggers bound to the
//! variable, applies the suppression window, evaluates the condition, and
//! dispatches the configured action. Suppression state is in-memory only and
//! resets on restart. A non-numeric current value evaluates every condition
//! to false; dispatch failures never abort sibling triggers.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{GatewaySrvError, Result};
use crate::model::{ActionKind, Trigger, TriggerAction, Variable};
use crate::registry::Registry;

const DEFAULT_MESSAGE_TEMPLATE: &str =
    "Trigger fired for {VariableName}: value {CurrentValue} at {Timestamp}";

/// Render the action message, substituting the trigger placeholders
pub fn render_message(template: &str, trigger: &Trigger, variable: &Variable, value: f64) -> String {
    let (lower, upper) = trigger.condition.bounds().unwrap_or((f64::NAN, f64::NAN));
    let threshold = trigger.condition.threshold().unwrap_or(f64::NAN);
    template
        .replace("{VariableName}", &variable.name)
        .replace("{CurrentValue}", &value.to_string())
        .replace("{Threshold}", &threshold.to_string())
        .replace("{LowerBound}", &lower.to_string())
        .replace("{UpperBound}", &upper.to_string())
        .replace("{Timestamp}", &Utc::now().timestamp_millis().to_string())
}

/// Delivery boundary for fired triggers. Email/notification gateways live
/// behind the webhook kind; the core only renders and posts.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: &TriggerAction, message: &str) -> Result<()>;
}

/// Default dispatcher: logs, or POSTs the rendered message to a configured URL
pub struct HttpActionDispatcher {
    client: reqwest::Client,
}

impl HttpActionDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionDispatcher for HttpActionDispatcher {
    async fn dispatch(&self, action: &TriggerAction, message: &str) -> Result<()> {
        match action.kind {
            ActionKind::Log => {
                info!(target: "gatewaysrv::trigger_action", "{message}");
                Ok(())
            }
            ActionKind::Webhook => {
                let url = action
                    .config
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewaySrvError::config("webhook action without url"))?;
                let response = self
                    .client
                    .post(url)
                    .json(&serde_json::json!({ "message": message }))
                    .send()
                    .await
                    .map_err(|e| GatewaySrvError::io(format!("webhook delivery: {e}")))?;
                if !response.status().is_success() {
                    return Err(GatewaySrvError::io(format!(
                        "webhook returned {}",
                        response.status()
                    )));
                }
                Ok(())
            }
            ActionKind::Publish => {
                // Republish actions are routed through the MQTT manager by the
                // runtime wiring; a bare dispatcher can only log them.
                info!(target: "gatewaysrv::trigger_action", "publish action: {message}");
                Ok(())
            }
        }
    }
}

/// Trigger evaluator with per-trigger suppression windows
pub struct TriggerEngine {
    registry: Arc<Registry>,
    dispatcher: Arc<dyn ActionDispatcher>,
    /// Trigger id -> instant until which the trigger stays suppressed
    suppressed: Arc<DashMap<u32, Instant>>,
}

impl TriggerEngine {
    pub fn new(registry: Arc<Registry>, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
            suppressed: Arc::new(DashMap::new()),
        }
    }

    pub fn is_suppressed(&self, trigger_id: u32) -> bool {
        match self.suppressed.get(&trigger_id) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }

    /// Evaluate all active triggers bound to the variable against its new
    /// numeric value. `numeric` is `None` for non-numeric values, which makes
    /// every condition evaluate to false.
    pub async fn evaluate(&self, variable: &Variable, numeric: Option<f64>) {
        let triggers = self.registry.triggers_for_variable(variable.id);
        for trigger in triggers {
            if !trigger.active {
                continue;
            }
            if self.is_suppressed(trigger.id) {
                debug!(trigger_id = trigger.id, "Trigger inside suppression window");
                continue;
            }
            let Some(value) = numeric else {
                debug!(
                    trigger_id = trigger.id,
                    variable_id = variable.id,
                    "Non-numeric value, condition treated as not met"
                );
                continue;
            };
            if !trigger.condition.matches(value) {
                continue;
            }
            self.fire(&trigger, variable, value).await;
        }
    }

    async fn fire(&self, trigger: &Trigger, variable: &Variable, value: f64) {
        let template = trigger
            .action
            .config
            .get("template")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MESSAGE_TEMPLATE);
        let message = render_message(template, trigger, variable, value);

        if let Err(e) = self.dispatcher.dispatch(&trigger.action, &message).await {
            warn!(trigger_id = trigger.id, "Trigger action dispatch failed: {e}");
        }

        self.registry.set_trigger_fired(trigger.id, Utc::now());

        if let Some(window) = trigger.suppression {
            let until = Instant::now() + window;
            self.suppressed.insert(trigger.id, until);
            // One-shot timer clears the suppression entry when it elapses
            let suppressed = Arc::clone(&self.suppressed);
            let trigger_id = trigger.id;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                // A later firing may have re-armed the window; only clear an
                // entry that has actually expired.
                if let Some(entry) = suppressed.get(&trigger_id) {
                    if Instant::now() >= *entry {
                        drop(entry);
                        suppressed.remove(&trigger_id);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, TriggerCondition};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDispatcher {
        fired: AtomicUsize,
    }

    #[async_trait]
    impl ActionDispatcher for CountingDispatcher {
        async fn dispatch(&self, _action: &TriggerAction, _message: &str) -> Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn variable() -> Variable {
        Variable {
            id: 1,
            table_id: 1,
            name: "boiler_temp".into(),
            address: "DB1.DBD0".into(),
            data_type: DataType::Float32,
            polling_interval_ms: 100,
            active: true,
            last_raw: None,
            last_value: None,
            last_numeric: None,
            last_update: None,
            history_enabled: false,
            history_deadband: None,
            alarm_enabled: false,
            alarm_min: None,
            alarm_max: None,
            alarm_deadband: None,
        }
    }

    fn trigger(id: u32, suppression: Option<Duration>) -> Trigger {
        Trigger {
            id,
            name: format!("trigger-{id}"),
            condition: TriggerCondition::GreaterThan { threshold: 50.0 },
            action: TriggerAction {
                kind: ActionKind::Log,
                config: serde_json::json!({}),
            },
            suppression,
            last_triggered: None,
            active: true,
        }
    }

    fn engine_with(
        triggers: Vec<Trigger>,
    ) -> (TriggerEngine, Arc<CountingDispatcher>, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let bindings = triggers
            .iter()
            .map(|t| crate::model::TriggerVariable {
                trigger_id: t.id,
                variable_id: 1,
            })
            .collect();
        registry.load_triggers(triggers, bindings);
        let dispatcher = Arc::new(CountingDispatcher {
            fired: AtomicUsize::new(0),
        });
        let engine = TriggerEngine::new(Arc::clone(&registry), dispatcher.clone());
        (engine, dispatcher, registry)
    }

    #[tokio::test]
    async fn fires_on_matching_condition() {
        let (engine, dispatcher, _) = engine_with(vec![trigger(1, None)]);
        engine.evaluate(&variable(), Some(55.0)).await;
        assert_eq!(dispatcher.fired.load(Ordering::SeqCst), 1);

        engine.evaluate(&variable(), Some(45.0)).await;
        assert_eq!(dispatcher.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_numeric_value_is_condition_false() {
        let (engine, dispatcher, _) = engine_with(vec![trigger(1, None)]);
        engine.evaluate(&variable(), None).await;
        assert_eq!(dispatcher.fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_window_debounces() {
        let (engine, dispatcher, _) =
            engine_with(vec![trigger(1, Some(Duration::from_secs(5)))]);
        let var = variable();

        engine.evaluate(&var, Some(60.0)).await;
        assert_eq!(dispatcher.fired.load(Ordering::SeqCst), 1);

        // t = 2s: still suppressed for the same breaching value
        tokio::time::advance(Duration::from_secs(2)).await;
        engine.evaluate(&var, Some(60.0)).await;
        assert_eq!(dispatcher.fired.load(Ordering::SeqCst), 1);

        // t = 6s: eligible again
        tokio::time::advance(Duration::from_secs(4)).await;
        engine.evaluate(&var, Some(60.0)).await;
        assert_eq!(dispatcher.fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatch_failure_does_not_abort_siblings() {
        struct FailingFirst {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl ActionDispatcher for FailingFirst {
            async fn dispatch(&self, _action: &TriggerAction, _message: &str) -> Result<()> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(GatewaySrvError::io("smtp relay down"))
                } else {
                    Ok(())
                }
            }
        }

        let registry = Arc::new(Registry::new());
        registry.load_triggers(
            vec![trigger(1, None), trigger(2, None)],
            vec![
                crate::model::TriggerVariable {
                    trigger_id: 1,
                    variable_id: 1,
                },
                crate::model::TriggerVariable {
                    trigger_id: 2,
                    variable_id: 1,
                },
            ],
        );
        let dispatcher = Arc::new(FailingFirst {
            calls: AtomicUsize::new(0),
        });
        let engine = TriggerEngine::new(registry, dispatcher.clone());
        engine.evaluate(&variable(), Some(99.0)).await;
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn message_rendering_substitutes_placeholders() {
        let mut t = trigger(1, None);
        t.condition = TriggerCondition::InRange {
            lower: 10.0,
            upper: 20.0,
        };
        let message = render_message(
            "{VariableName} is {CurrentValue} in [{LowerBound},{UpperBound}]",
            &t,
            &variable(),
            15.0,
        );
        assert_eq!(message, "boiler_temp is 15 in [10,20]");
    }
}
