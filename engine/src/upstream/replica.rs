//! MariaDB replica executor
//!
//! One lazily connected pool per lane. Each session gets a server-side
//! statement ceiling on connect, and every call is additionally wrapped in
//! a client-side read timeout a few seconds longer than that ceiling.

use super::sql::{self, Bind};
use super::{Lane, Query, QueryExecutor, Row};
use crate::config::{Credentials, LaneConfig, UpstreamConfig};
use async_trait::async_trait;
use sdk::errors::EngineError;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, ConnectOptions, Row as SqlxRow};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Slack between the server ceiling and the client read timeout
const READ_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Connections per lane
const MAX_CONNECTIONS: u32 = 4;

struct LanePool {
    pool: MySqlPool,
    budget_secs: u64,
    read_timeout: Duration,
}

/// [`QueryExecutor`] backed by the replica databases
pub struct ReplicaExecutor {
    bounded: LanePool,
    extended: LanePool,
}

impl ReplicaExecutor {
    /// Build both lane pools without connecting
    ///
    /// Connections are opened on first use, so a missing replica surfaces
    /// as [`EngineError::UpstreamConnection`] from `execute`.
    pub fn connect_lazy(config: &UpstreamConfig, credentials: &Credentials) -> Self {
        Self {
            bounded: lane_pool(config, &config.bounded, credentials),
            extended: lane_pool(config, &config.extended, credentials),
        }
    }

    fn lane(&self, lane: Lane) -> &LanePool {
        match lane {
            Lane::Bounded => &self.bounded,
            Lane::Extended => &self.extended,
        }
    }

    /// Round-trip `SELECT 1` on each lane
    pub async fn check_lanes(&self) -> Vec<(Lane, Result<Duration, EngineError>)> {
        let mut results = Vec::new();
        for lane in [Lane::Bounded, Lane::Extended] {
            let pool = self.lane(lane);
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                pool.read_timeout,
                sqlx::query("SELECT 1").execute(&pool.pool),
            )
            .await;
            let result = match outcome {
                Ok(Ok(_)) => Ok(started.elapsed()),
                Ok(Err(e)) => Err(classify(e, lane, pool.budget_secs)),
                Err(_) => Err(timeout_error(lane, pool.budget_secs)),
            };
            results.push((lane, result));
        }
        results
    }

    /// Close both pools
    pub async fn close(&self) {
        self.bounded.pool.close().await;
        self.extended.pool.close().await;
    }
}

fn lane_pool(config: &UpstreamConfig, lane: &LaneConfig, credentials: &Credentials) -> LanePool {
    let options = MySqlConnectOptions::new()
        .host(&lane.host)
        .port(config.port)
        .username(&credentials.user)
        .password(&credentials.password)
        .database(&config.database)
        .disable_statement_logging();

    let budget_secs = lane.statement_timeout_secs;
    let pool = MySqlPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(lane.connect_timeout_secs))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // MariaDB takes seconds, MySQL takes milliseconds; either may be absent.
                let mariadb = format!("SET SESSION max_statement_time = {}", budget_secs);
                if sqlx::query(&mariadb).execute(&mut *conn).await.is_err() {
                    let mysql = format!("SET SESSION max_execution_time = {}", budget_secs * 1000);
                    if let Err(e) = sqlx::query(&mysql).execute(&mut *conn).await {
                        debug!("Server refused a statement ceiling: {}", e);
                    }
                }
                Ok(())
            })
        })
        .connect_lazy_with(options);

    LanePool {
        pool,
        budget_secs,
        read_timeout: Duration::from_secs(budget_secs) + READ_TIMEOUT_GRACE,
    }
}

fn timeout_error(lane: Lane, budget_secs: u64) -> EngineError {
    EngineError::UpstreamTimeout {
        lane: lane.to_string(),
        budget_secs,
    }
}

/// Map a driver error onto the upstream taxonomy
fn classify(err: sqlx::Error, lane: Lane, budget_secs: u64) -> EngineError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_) => {
            return EngineError::UpstreamConnection(err.to_string());
        }
        sqlx::Error::Database(db) => {
            // 1969: MariaDB statement timeout, 3024: MySQL execution time exceeded
            if matches!(db.code().as_deref(), Some("1969") | Some("3024") | Some("70100")) {
                return timeout_error(lane, budget_secs);
            }
        }
        _ => {}
    }

    if is_timeout_message(&err.to_string()) {
        timeout_error(lane, budget_secs)
    } else {
        EngineError::UpstreamConnection(err.to_string())
    }
}

fn is_timeout_message(message: &str) -> bool {
    let message = message.to_lowercase();
    ["timeout", "timed out", "max_statement_time", "max_execution_time"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn decode_row(row: &MySqlRow) -> Row {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map(Value::from)
        } else if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            v.map(Value::from)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map(Value::from)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            v.map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
        } else {
            None
        };
        out.insert(column.name(), value.unwrap_or(Value::Null));
    }
    out
}

#[async_trait]
impl QueryExecutor for ReplicaExecutor {
    async fn execute(&self, query: &Query, lane: Lane) -> Result<Vec<Row>, EngineError> {
        let pool = self.lane(lane);
        let statement = sql::render(query);

        let mut prepared = sqlx::query(&statement.sql);
        for bind in &statement.binds {
            prepared = match bind {
                Bind::Text(s) => prepared.bind(s.clone()),
                Bind::Int(i) => prepared.bind(*i),
            };
        }

        let started = Instant::now();
        let rows = match tokio::time::timeout(pool.read_timeout, prepared.fetch_all(&pool.pool))
            .await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                let err = classify(e, lane, pool.budget_secs);
                warn!("{} on {} lane failed: {}", query, lane, err);
                return Err(err);
            }
            Err(_) => {
                warn!(
                    "{} on {} lane hit the client read timeout after {:?}",
                    query,
                    lane,
                    started.elapsed()
                );
                return Err(timeout_error(lane, pool.budget_secs));
            }
        };

        debug!(
            "{} on {} lane returned {} rows in {:?}",
            query,
            lane,
            rows.len(),
            started.elapsed()
        );

        Ok(rows.iter().map(decode_row).collect())
    }
}
