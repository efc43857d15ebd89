//! Variable update processing pipeline
//!
//! An ordered chain of independent stages, each receiving the same mutable
//! [`UpdateContext`]. A stage may transform the context, call a collaborator,
//! or set the `handled` flag to stop later stages. The order is a
//! configuration artifact, not a hard-coded constant; the conversion stage
//! must run before any stage whose side effect should be suppressed for
//! unchanged values.

pub mod stages;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::model::{FieldValue, Variable};

/// Per-update processing context, created for each poll result and discarded
/// after the chain completes.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    /// Snapshot of the variable at poll time
    pub variable: Variable,
    /// Raw value as read from the device
    pub raw: FieldValue,
    /// Canonical string form, filled by the conversion stage
    pub value: String,
    /// Numeric form when one exists, filled by the conversion stage
    pub numeric: Option<f64>,
    /// Poll timestamp
    pub timestamp: DateTime<Utc>,
    /// Short-circuit flag: once set, no later stage runs
    pub handled: bool,
}

impl UpdateContext {
    pub fn new(variable: Variable, raw: FieldValue, timestamp: DateTime<Utc>) -> Self {
        Self {
            variable,
            raw,
            value: String::new(),
            numeric: None,
            timestamp,
            handled: false,
        }
    }
}

/// One stage of the update chain
#[async_trait]
pub trait UpdateStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut UpdateContext) -> Result<()>;
}

/// Stage identifiers used in the configured order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Convert,
    Alarm,
    Trigger,
    Publish,
    History,
    Notify,
}

impl StageKind {
    /// The documented default order: conversion (and its dedup gate) first,
    /// notification last.
    pub fn default_order() -> &'static [StageKind] {
        &[
            StageKind::Convert,
            StageKind::Alarm,
            StageKind::Trigger,
            StageKind::Publish,
            StageKind::History,
            StageKind::Notify,
        ]
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Convert => "convert",
            StageKind::Alarm => "alarm",
            StageKind::Trigger => "trigger",
            StageKind::Publish => "publish",
            StageKind::History => "history",
            StageKind::Notify => "notify",
        };
        f.write_str(name)
    }
}

/// The ordered stage chain
pub struct UpdatePipeline {
    stages: Vec<Arc<dyn UpdateStage>>,
}

impl UpdatePipeline {
    pub fn new(stages: Vec<Arc<dyn UpdateStage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the chain over one update. Stage errors are logged and do not
    /// abort later stages; only the `handled` flag stops the chain.
    pub async fn process(&self, mut ctx: UpdateContext) -> UpdateContext {
        for stage in &self.stages {
            if ctx.handled {
                break;
            }
            if let Err(e) = stage.process(&mut ctx).await {
                warn!(
                    stage = stage.name(),
                    variable_id = ctx.variable.id,
                    "Pipeline stage failed: {e}"
                );
            }
        }
        ctx
    }
}
