//! In-memory device/variable registry
//!
//! Concurrently-readable maps of all definitional state, refreshed from the
//! backing store. The invariant is many concurrent readers, one logical
//! writer per key: bulk loads replace whole maps, the scheduler mutates only
//! value/timestamp fields, session managers mutate only connection-state
//! fields, and management-layer mutations arrive through the incremental
//! `apply_*` operations.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::model::{
    Device, MqttAlias, MqttServer, Trigger, TriggerVariable, Variable, VariableTable,
};

/// Concurrent registry of gateway configuration and live values
#[derive(Debug, Default)]
pub struct Registry {
    devices: DashMap<u32, Device>,
    tables: DashMap<u32, VariableTable>,
    variables: DashMap<u32, Variable>,
    servers: DashMap<u32, MqttServer>,
    /// Aliases grouped by variable id; duplicates of the (variable, server)
    /// natural key are kept and surfaced at load time
    aliases: DashMap<u32, Vec<MqttAlias>>,
    triggers: DashMap<u32, Trigger>,
    /// Trigger ids grouped by variable id
    trigger_bindings: DashMap<u32, Vec<u32>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Bulk load (registry refresh)
    // ------------------------------------------------------------------

    pub fn load_devices(&self, devices: Vec<Device>) {
        self.devices.clear();
        for d in devices {
            self.devices.insert(d.id, d);
        }
        info!("Registry loaded {} devices", self.devices.len());
    }

    pub fn load_tables(&self, tables: Vec<VariableTable>) {
        self.tables.clear();
        for t in tables {
            self.tables.insert(t.id, t);
        }
    }

    pub fn load_variables(&self, variables: Vec<Variable>) {
        self.variables.clear();
        for v in variables {
            if v.polling_interval_ms == 0 {
                warn!(
                    variable_id = v.id,
                    "Variable has zero polling interval, skipping"
                );
                continue;
            }
            self.variables.insert(v.id, v);
        }
        info!("Registry loaded {} variables", self.variables.len());
    }

    pub fn load_servers(&self, servers: Vec<MqttServer>) {
        self.servers.clear();
        for s in servers {
            self.servers.insert(s.id, s);
        }
    }

    /// Load alias bindings. Duplicate (variable, server) pairs are a
    /// configuration error: they are logged and kept, never silently
    /// deduplicated.
    pub fn load_aliases(&self, aliases: Vec<MqttAlias>) {
        self.aliases.clear();
        for alias in aliases {
            let mut entry = self.aliases.entry(alias.variable_id).or_default();
            if entry
                .iter()
                .any(|existing| existing.server_id == alias.server_id)
            {
                error!(
                    variable_id = alias.variable_id,
                    server_id = alias.server_id,
                    "Duplicate MQTT alias binding for (variable, server) pair"
                );
            }
            entry.push(alias);
        }
    }

    pub fn load_triggers(&self, triggers: Vec<Trigger>, bindings: Vec<TriggerVariable>) {
        self.triggers.clear();
        self.trigger_bindings.clear();
        for t in triggers {
            self.triggers.insert(t.id, t);
        }
        for b in bindings {
            if !self.triggers.contains_key(&b.trigger_id) {
                warn!(
                    trigger_id = b.trigger_id,
                    variable_id = b.variable_id,
                    "Trigger binding references unknown trigger, skipping"
                );
                continue;
            }
            self.trigger_bindings
                .entry(b.variable_id)
                .or_default()
                .push(b.trigger_id);
        }
        info!("Registry loaded {} triggers", self.triggers.len());
    }

    // ------------------------------------------------------------------
    // Incremental management-layer mutations
    // ------------------------------------------------------------------

    /// Apply a variable-active-changed event without a full reload
    pub fn apply_variable_active_changed(&self, variable_id: u32, active: bool) {
        match self.variables.get_mut(&variable_id) {
            Some(mut v) => v.active = active,
            None => warn!(variable_id, "Active change for unknown variable"),
        }
    }

    /// Apply an edited variable (address/interval/flags) without a full
    /// reload. Live value fields are preserved.
    pub fn apply_variable_changed(&self, updated: Variable) {
        if updated.polling_interval_ms == 0 {
            warn!(
                variable_id = updated.id,
                "Rejected variable update with zero polling interval"
            );
            return;
        }
        match self.variables.get_mut(&updated.id) {
            Some(mut v) => {
                let live = (
                    v.last_raw.take(),
                    v.last_value.take(),
                    v.last_numeric.take(),
                    v.last_update.take(),
                );
                *v = updated;
                (v.last_raw, v.last_value, v.last_numeric, v.last_update) = live;
            }
            None => {
                self.variables.insert(updated.id, updated);
            }
        }
    }

    /// Apply a batch import: upsert every variable in one pass
    pub fn apply_batch_import(&self, variables: Vec<Variable>) {
        let count = variables.len();
        for v in variables {
            self.apply_variable_changed(v);
        }
        info!("Applied batch import of {count} variables");
    }

    pub fn remove_variable(&self, variable_id: u32) {
        self.variables.remove(&variable_id);
        self.aliases.remove(&variable_id);
        self.trigger_bindings.remove(&variable_id);
    }

    // ------------------------------------------------------------------
    // Core-owned mutations
    // ------------------------------------------------------------------

    /// Stamp a successful poll. Called by the scheduler for every variable a
    /// batch read returned, whether or not the value changed; the polling
    /// interval measures reads, not changes.
    pub fn mark_polled(&self, variable_id: u32, at: DateTime<Utc>) {
        if let Some(mut v) = self.variables.get_mut(&variable_id) {
            v.last_update = Some(at);
        }
    }

    /// Store a converted value (called by the conversion stage on change)
    pub fn update_value(&self, variable_id: u32, raw: String, value: String, numeric: Option<f64>) {
        if let Some(mut v) = self.variables.get_mut(&variable_id) {
            v.last_raw = Some(raw);
            v.last_value = Some(value);
            v.last_numeric = numeric;
        }
    }

    /// Update a device's connection-state fields (session manager only)
    pub fn set_device_connection(&self, device_id: u32, connected: bool, error: Option<String>) {
        if let Some(mut d) = self.devices.get_mut(&device_id) {
            d.connected = connected;
            d.last_error = error;
        }
    }

    /// Update a broker's connection flag (broker manager only)
    pub fn set_server_connection(&self, server_id: u32, connected: bool) {
        if let Some(mut s) = self.servers.get_mut(&server_id) {
            s.connected = connected;
        }
    }

    /// Record when a trigger last fired
    pub fn set_trigger_fired(&self, trigger_id: u32, at: DateTime<Utc>) {
        if let Some(mut t) = self.triggers.get_mut(&trigger_id) {
            t.last_triggered = Some(at);
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, id: u32) -> Option<Device> {
        self.devices.get(&id).map(|d| d.clone())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.clone()).collect()
    }

    pub fn active_devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| d.active)
            .map(|d| d.clone())
            .collect()
    }

    pub fn variable(&self, id: u32) -> Option<Variable> {
        self.variables.get(&id).map(|v| v.clone())
    }

    /// Active variables of a device, walking its active tables
    pub fn pollable_variables(&self, device_id: u32) -> Vec<Variable> {
        let table_ids: Vec<u32> = self
            .tables
            .iter()
            .filter(|t| t.device_id == device_id && t.active)
            .map(|t| t.id)
            .collect();
        self.variables
            .iter()
            .filter(|v| v.active && table_ids.contains(&v.table_id))
            .map(|v| v.clone())
            .collect()
    }

    /// Find the variable a device address maps to
    pub fn variable_by_address(&self, device_id: u32, address: &str) -> Option<Variable> {
        let table_ids: Vec<u32> = self
            .tables
            .iter()
            .filter(|t| t.device_id == device_id)
            .map(|t| t.id)
            .collect();
        self.variables
            .iter()
            .find(|v| v.address == address && table_ids.contains(&v.table_id))
            .map(|v| v.clone())
    }

    pub fn server(&self, id: u32) -> Option<MqttServer> {
        self.servers.get(&id).map(|s| s.clone())
    }

    pub fn servers(&self) -> Vec<MqttServer> {
        self.servers.iter().map(|s| s.clone()).collect()
    }

    pub fn aliases_for_variable(&self, variable_id: u32) -> Vec<MqttAlias> {
        self.aliases
            .get(&variable_id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn trigger(&self, id: u32) -> Option<Trigger> {
        self.triggers.get(&id).map(|t| t.clone())
    }

    pub fn triggers_for_variable(&self, variable_id: u32) -> Vec<Trigger> {
        let Some(ids) = self.trigger_bindings.get(&variable_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.triggers.get(id).map(|t| t.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, ProtocolKind};

    fn device(id: u32) -> Device {
        Device {
            id,
            name: format!("plc-{id}"),
            protocol: ProtocolKind::S7,
            address: "127.0.0.1".into(),
            port: 102,
            rack: 0,
            slot: 1,
            endpoint_url: None,
            active: true,
            connected: false,
            last_error: None,
        }
    }

    fn variable(id: u32, table_id: u32) -> Variable {
        Variable {
            id,
            table_id,
            name: format!("var-{id}"),
            address: format!("DB1.DBW{}", id * 2),
            data_type: DataType::Int16,
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

    #[test]
    fn pollable_variables_respect_table_and_active_flags() {
        let reg = Registry::new();
        reg.load_devices(vec![device(1)]);
        reg.load_tables(vec![
            VariableTable {
                id: 10,
                device_id: 1,
                name: "active".into(),
                active: true,
            },
            VariableTable {
                id: 11,
                device_id: 1,
                name: "inactive".into(),
                active: false,
            },
        ]);
        let mut inactive_var = variable(3, 10);
        inactive_var.active = false;
        reg.load_variables(vec![variable(1, 10), variable(2, 11), inactive_var]);

        let pollable = reg.pollable_variables(1);
        assert_eq!(pollable.len(), 1);
        assert_eq!(pollable[0].id, 1);
    }

    #[test]
    fn variable_edit_preserves_live_values() {
        let reg = Registry::new();
        reg.load_variables(vec![variable(1, 10)]);
        reg.mark_polled(1, Utc::now());
        reg.update_value(1, "5".into(), "5".into(), Some(5.0));

        let mut edited = variable(1, 10);
        edited.polling_interval_ms = 5000;
        reg.apply_variable_changed(edited);

        let v = reg.variable(1).unwrap();
        assert_eq!(v.polling_interval_ms, 5000);
        assert_eq!(v.last_value.as_deref(), Some("5"));
        assert!(v.last_update.is_some());
    }

    #[tracing_test::traced_test]
    #[test]
    fn duplicate_alias_pairs_are_surfaced_not_deduped() {
        let reg = Registry::new();
        let alias = MqttAlias {
            variable_id: 1,
            server_id: 2,
            alias: "tempA".into(),
        };
        reg.load_aliases(vec![alias.clone(), alias]);
        // Surfaced as an error in the log, but both rows remain visible
        assert_eq!(reg.aliases_for_variable(1).len(), 2);
        assert!(logs_contain("Duplicate MQTT alias binding"));
    }
}
