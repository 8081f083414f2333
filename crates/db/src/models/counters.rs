use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

const HIGH_COST_ALERT_CAP: i64 = 100;
const TIMESERIES_CAP: i64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DailyCounter {
    pub day: String,
    pub model: String,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub cost_usd: f64,
    pub turns: i64,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HighCostAlert {
    pub task_id: String,
    pub model: String,
    pub cost_usd: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TimeseriesPoint {
    pub task_id: String,
    pub model: String,
    pub success: bool,
    pub cost_usd: f64,
    pub turns: i64,
    pub execution_time_ms: i64,
    pub created_at: String,
}

/// Records the outcome of one completed execution into the day/model aggregate, the
/// capped high-cost alert list, and the capped recent-executions ring.
pub async fn record_execution(
    pool: &SqlitePool,
    task_id: &str,
    model: &str,
    success: bool,
    cost_usd: f64,
    turns: i64,
    execution_time_ms: i64,
    cost_threshold_usd: f64,
) -> Result<(), sqlx::Error> {
    let day = Utc::now().date_naive().to_string();
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT INTO daily_counters (day, model, total, successful, failed, cost_usd, turns, \
         execution_time_ms) VALUES (?, ?, 1, ?, ?, ?, ?, ?) \
         ON CONFLICT(day, model) DO UPDATE SET \
           total = total + 1, \
           successful = successful + excluded.successful, \
           failed = failed + excluded.failed, \
           cost_usd = cost_usd + excluded.cost_usd, \
           turns = turns + excluded.turns, \
           execution_time_ms = execution_time_ms + excluded.execution_time_ms",
    )
    .bind(&day)
    .bind(model)
    .bind(if success { 1 } else { 0 })
    .bind(if success { 0 } else { 1 })
    .bind(cost_usd)
    .bind(turns)
    .bind(execution_time_ms)
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO execution_timeseries (task_id, model, success, cost_usd, turns, \
         execution_time_ms, created_at) VALUES (?,?,?,?,?,?,?)",
    )
    .bind(task_id)
    .bind(model)
    .bind(success)
    .bind(cost_usd)
    .bind(turns)
    .bind(execution_time_ms)
    .bind(&now)
    .execute(pool)
    .await?;

    sqlx::query(
        "DELETE FROM execution_timeseries WHERE id NOT IN \
         (SELECT id FROM execution_timeseries ORDER BY id DESC LIMIT ?)",
    )
    .bind(TIMESERIES_CAP)
    .execute(pool)
    .await?;

    if cost_usd > cost_threshold_usd {
        sqlx::query(
            "INSERT INTO high_cost_alerts (task_id, model, cost_usd, created_at) VALUES (?,?,?,?)",
        )
        .bind(task_id)
        .bind(model)
        .bind(cost_usd)
        .bind(&now)
        .execute(pool)
        .await?;

        sqlx::query(
            "DELETE FROM high_cost_alerts WHERE id NOT IN \
             (SELECT id FROM high_cost_alerts ORDER BY id DESC LIMIT ?)",
        )
        .bind(HIGH_COST_ALERT_CAP)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn daily_counters_since(
    pool: &SqlitePool,
    since: NaiveDate,
) -> Result<Vec<DailyCounter>, sqlx::Error> {
    sqlx::query_as(
        "SELECT day, model, total, successful, failed, cost_usd, turns, execution_time_ms \
         FROM daily_counters WHERE day >= ? ORDER BY day ASC",
    )
    .bind(since.to_string())
    .fetch_all(pool)
    .await
}

pub async fn last_7_days_series(pool: &SqlitePool) -> Result<Vec<DailyCounter>, sqlx::Error> {
    daily_counters_since(pool, (Utc::now() - Duration::days(7)).date_naive()).await
}

pub async fn latest_high_cost_alerts(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<HighCostAlert>, sqlx::Error> {
    sqlx::query_as(
        "SELECT task_id, model, cost_usd, created_at FROM high_cost_alerts \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}
