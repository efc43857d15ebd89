//! Persistence boundary
//!
//! The core only needs bulk configuration loads, point reads, and a batched
//! history insert; everything else about the schema is an external concern.
//! A minimal `CREATE TABLE IF NOT EXISTS` bootstrap stands in for migration
//! tooling.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{GatewaySrvError, Result};
use crate::model::{
    DataType, Device, MessageTemplate, MqttAlias, MqttServer, ProtocolKind, Trigger,
    TriggerVariable, Variable, VariableHistory, VariableTable,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    protocol TEXT NOT NULL,
    address TEXT NOT NULL DEFAULT '',
    port INTEGER NOT NULL DEFAULT 0,
    rack INTEGER NOT NULL DEFAULT 0,
    slot INTEGER NOT NULL DEFAULT 0,
    endpoint_url TEXT,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS variable_tables (
    id INTEGER PRIMARY KEY,
    device_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS variables (
    id INTEGER PRIMARY KEY,
    table_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    address TEXT NOT NULL,
    data_type TEXT NOT NULL,
    polling_interval_ms INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    history_enabled INTEGER NOT NULL DEFAULT 0,
    history_deadband REAL,
    alarm_enabled INTEGER NOT NULL DEFAULT 0,
    alarm_min REAL,
    alarm_max REAL,
    alarm_deadband REAL
);
CREATE TABLE IF NOT EXISTS mqtt_servers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL DEFAULT 1883,
    client_id TEXT NOT NULL,
    username TEXT,
    password TEXT,
    subscribe_topic TEXT NOT NULL DEFAULT '',
    publish_topic TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1,
    template_header TEXT NOT NULL DEFAULT '',
    template_content TEXT NOT NULL DEFAULT '',
    template_footer TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS mqtt_aliases (
    variable_id INTEGER NOT NULL,
    server_id INTEGER NOT NULL,
    alias TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS triggers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    condition TEXT NOT NULL,
    action TEXT NOT NULL,
    suppression_ms INTEGER,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS trigger_variables (
    trigger_id INTEGER NOT NULL,
    variable_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS variable_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    variable_id INTEGER NOT NULL,
    value TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
"#;

/// SQLite-backed configuration store
#[derive(Debug, Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    /// Open (creating if missing) the gateway database and ensure the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            path.as_ref().display()
        ))
        .map_err(|e| GatewaySrvError::StorageError(e.to_string()))?
        .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn bootstrap(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn load_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM devices").fetch_all(&self.pool).await?;
        let mut devices = Vec::with_capacity(rows.len());
        for row in rows {
            match device_from_row(&row) {
                Ok(d) => devices.push(d),
                Err(e) => warn!("Skipping malformed device row: {e}"),
            }
        }
        debug!("Loaded {} devices from store", devices.len());
        Ok(devices)
    }

    pub async fn load_tables(&self) -> Result<Vec<VariableTable>> {
        let rows = sqlx::query("SELECT * FROM variable_tables")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| VariableTable {
                id: row.get::<i64, _>("id") as u32,
                device_id: row.get::<i64, _>("device_id") as u32,
                name: row.get("name"),
                active: row.get::<i64, _>("active") != 0,
            })
            .collect())
    }

    pub async fn load_variables(&self) -> Result<Vec<Variable>> {
        let rows = sqlx::query("SELECT * FROM variables")
            .fetch_all(&self.pool)
            .await?;
        let mut variables = Vec::with_capacity(rows.len());
        for row in rows {
            match variable_from_row(&row) {
                Ok(v) => variables.push(v),
                Err(e) => warn!("Skipping malformed variable row: {e}"),
            }
        }
        Ok(variables)
    }

    pub async fn load_servers(&self) -> Result<Vec<MqttServer>> {
        let rows = sqlx::query("SELECT * FROM mqtt_servers")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| MqttServer {
                id: row.get::<i64, _>("id") as u32,
                name: row.get("name"),
                host: row.get("host"),
                port: row.get::<i64, _>("port") as u16,
                client_id: row.get("client_id"),
                username: row.get("username"),
                password: row.get("password"),
                subscribe_topic: row.get("subscribe_topic"),
                publish_topic: row.get("publish_topic"),
                active: row.get::<i64, _>("active") != 0,
                connected: false,
                template: MessageTemplate {
                    header: row.get("template_header"),
                    content: row.get("template_content"),
                    footer: row.get("template_footer"),
                },
            })
            .collect())
    }

    pub async fn load_aliases(&self) -> Result<Vec<MqttAlias>> {
        let rows = sqlx::query("SELECT * FROM mqtt_aliases")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| MqttAlias {
                variable_id: row.get::<i64, _>("variable_id") as u32,
                server_id: row.get::<i64, _>("server_id") as u32,
                alias: row.get("alias"),
            })
            .collect())
    }

    pub async fn load_triggers(&self) -> Result<(Vec<Trigger>, Vec<TriggerVariable>)> {
        let rows = sqlx::query("SELECT * FROM triggers")
            .fetch_all(&self.pool)
            .await?;
        let mut triggers = Vec::with_capacity(rows.len());
        for row in rows {
            match trigger_from_row(&row) {
                Ok(t) => triggers.push(t),
                Err(e) => warn!("Skipping malformed trigger row: {e}"),
            }
        }

        let rows = sqlx::query("SELECT * FROM trigger_variables")
            .fetch_all(&self.pool)
            .await?;
        let bindings = rows
            .iter()
            .map(|row| TriggerVariable {
                trigger_id: row.get::<i64, _>("trigger_id") as u32,
                variable_id: row.get::<i64, _>("variable_id") as u32,
            })
            .collect();
        Ok((triggers, bindings))
    }
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    let protocol: String = row.get("protocol");
    let protocol = ProtocolKind::parse(&protocol)
        .ok_or_else(|| GatewaySrvError::data(format!("unknown protocol '{protocol}'")))?;
    Ok(Device {
        id: row.get::<i64, _>("id") as u32,
        name: row.get("name"),
        protocol,
        address: row.get("address"),
        port: row.get::<i64, _>("port") as u16,
        rack: row.get::<i64, _>("rack") as u16,
        slot: row.get::<i64, _>("slot") as u16,
        endpoint_url: row.get("endpoint_url"),
        active: row.get::<i64, _>("active") != 0,
        connected: false,
        last_error: None,
    })
}

fn variable_from_row(row: &SqliteRow) -> Result<Variable> {
    let data_type: String = row.get("data_type");
    let data_type = DataType::parse(&data_type)
        .ok_or_else(|| GatewaySrvError::data(format!("unknown data type '{data_type}'")))?;
    Ok(Variable {
        id: row.get::<i64, _>("id") as u32,
        table_id: row.get::<i64, _>("table_id") as u32,
        name: row.get("name"),
        address: row.get("address"),
        data_type,
        polling_interval_ms: row.get::<i64, _>("polling_interval_ms") as u64,
        active: row.get::<i64, _>("active") != 0,
        last_raw: None,
        last_value: None,
        last_numeric: None,
        last_update: None,
        history_enabled: row.get::<i64, _>("history_enabled") != 0,
        history_deadband: row.get("history_deadband"),
        alarm_enabled: row.get::<i64, _>("alarm_enabled") != 0,
        alarm_min: row.get("alarm_min"),
        alarm_max: row.get("alarm_max"),
        alarm_deadband: row.get("alarm_deadband"),
    })
}

fn trigger_from_row(row: &SqliteRow) -> Result<Trigger> {
    let condition: String = row.get("condition");
    let condition = serde_json::from_str(&condition)
        .map_err(|e| GatewaySrvError::data(format!("bad trigger condition: {e}")))?;
    let action: String = row.get("action");
    let action = serde_json::from_str(&action)
        .map_err(|e| GatewaySrvError::data(format!("bad trigger action: {e}")))?;
    Ok(Trigger {
        id: row.get::<i64, _>("id") as u32,
        name: row.get("name"),
        condition,
        action,
        suppression: row
            .get::<Option<i64>, _>("suppression_ms")
            .map(|ms| Duration::from_millis(ms as u64)),
        last_triggered: None,
        active: row.get::<i64, _>("active") != 0,
    })
}

/// Batched-insert capability required by the history writer
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_batch(&self, rows: &[VariableHistory]) -> Result<()>;
}

/// SQLite-backed history store writing one multi-row insert per batch
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM variable_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn insert_batch(&self, rows: &[VariableHistory]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("INSERT INTO variable_history (variable_id, value, timestamp) ");
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.variable_id as i64)
                .push_bind(&row.value)
                .push_bind(row.timestamp.to_rfc3339());
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

/// In-memory history store used by tests and embedders
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    rows: Mutex<Vec<VariableHistory>>,
    batches: Mutex<Vec<usize>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<VariableHistory> {
        self.rows.lock().expect("history rows lock").clone()
    }

    /// Sizes of the batches received, in arrival order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().expect("history batches lock").clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn insert_batch(&self, rows: &[VariableHistory]) -> Result<()> {
        self.batches
            .lock()
            .expect("history batches lock")
            .push(rows.len());
        self.rows
            .lock()
            .expect("history rows lock")
            .extend_from_slice(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn bootstrap_and_batch_insert_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("gw.db")).await.unwrap();
        let history = SqliteHistoryStore::new(store.pool().clone());

        let rows: Vec<VariableHistory> = (0..5)
            .map(|i| VariableHistory {
                variable_id: i,
                value: format!("{i}"),
                timestamp: Utc::now(),
            })
            .collect();
        history.insert_batch(&rows).await.unwrap();
        assert_eq!(history.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn loads_from_empty_schema_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("gw.db")).await.unwrap();
        assert!(store.load_devices().await.unwrap().is_empty());
        assert!(store.load_variables().await.unwrap().is_empty());
        let (triggers, bindings) = store.load_triggers().await.unwrap();
        assert!(triggers.is_empty());
        assert!(bindings.is_empty());
    }
}
