use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::events::{BotEvent, EventSink};
use crate::execution::{CloseReason, Position, PositionStatus};
use crate::models::decimal_to_f64;
use crate::Result;

/// Postgres event log and position history
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    /// Connect to Postgres and run migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    /// Append an event to `bot_events`
    pub async fn append_event(&self, event: &BotEvent) -> Result<()> {
        sqlx::query("INSERT INTO bot_events (kind, symbol, payload) VALUES ($1, $2, $3)")
            .bind(event.kind())
            .bind(event.symbol())
            .bind(Json(event))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or update a position row
    pub async fn save_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, entry_price, quantity, stop_loss, take_profit,
                trailing_activation, trailing_stop, status, close_reason,
                exit_price, realized_pnl, estimated_fees, entry_order_id,
                protective_order_list_id, opened_at, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                trailing_stop = EXCLUDED.trailing_stop,
                status = EXCLUDED.status,
                close_reason = EXCLUDED.close_reason,
                exit_price = EXCLUDED.exit_price,
                realized_pnl = EXCLUDED.realized_pnl,
                estimated_fees = EXCLUDED.estimated_fees,
                protective_order_list_id = EXCLUDED.protective_order_list_id,
                closed_at = EXCLUDED.closed_at,
                updated_at = NOW()
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(to_decimal(position.entry_price)?)
        .bind(to_decimal(position.quantity)?)
        .bind(to_decimal(position.stop_loss_price)?)
        .bind(to_decimal(position.take_profit_price)?)
        .bind(to_decimal(position.trailing_activation_price)?)
        .bind(position.trailing_stop_price.map(to_decimal).transpose()?)
        .bind(status_str(position.status))
        .bind(position.close_reason.map(|r| r.as_str()))
        .bind(position.exit_price.map(to_decimal).transpose()?)
        .bind(position.realized_pnl.map(to_decimal).transpose()?)
        .bind(position.estimated_fees.map(to_decimal).transpose()?)
        .bind(&position.entry_order_id)
        .bind(&position.protective_order_list_id)
        .bind(position.opened_at)
        .bind(position.closed_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved position {} for {} to Postgres",
            position.id,
            position.symbol
        );

        Ok(())
    }

    /// Load positions opened in the last N days
    pub async fn load_recent_positions(&self, days: i64) -> Result<Vec<Position>> {
        let cutoff = Utc::now() - chrono::Duration::days(days);

        let rows = sqlx::query(
            r#"
            SELECT id, symbol, entry_price, quantity, stop_loss, take_profit,
                   trailing_activation, trailing_stop, status, close_reason,
                   exit_price, realized_pnl, estimated_fees, entry_order_id,
                   protective_order_list_id, opened_at, closed_at
            FROM positions
            WHERE opened_at >= $1
            ORDER BY opened_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let positions = rows.iter().map(position_from_row).collect::<Result<Vec<_>>>()?;

        tracing::info!("Loaded {} positions from Postgres", positions.len());

        Ok(positions)
    }

    /// Get total realized P&L (gross) across all closed positions
    pub async fn get_total_pnl(&self) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(realized_pnl), 0) AS total FROM positions WHERE status = 'Closed'",
        )
        .fetch_one(&self.pool)
        .await?;

        let total: Decimal = row.get("total");
        Ok(decimal_to_f64(total))
    }
}

#[async_trait]
impl EventSink for PostgresEventLog {
    async fn record(&self, event: &BotEvent) -> anyhow::Result<()> {
        self.append_event(event)
            .await
            .map_err(|e| anyhow::anyhow!("append event: {}", e))?;

        if let BotEvent::PositionOpened { position } | BotEvent::PositionClosed { position, .. } = event {
            self.save_position(position)
                .await
                .map_err(|e| anyhow::anyhow!("save position {}: {}", position.id, e))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

fn to_decimal(value: f64) -> Result<Decimal> {
    Decimal::from_f64(value).ok_or_else(|| format!("cannot store {} as NUMERIC", value).into())
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Pending => "Pending",
        PositionStatus::Open => "Open",
        PositionStatus::Closed => "Closed",
    }
}

fn parse_status(s: &str) -> Result<PositionStatus> {
    match s {
        "Pending" => Ok(PositionStatus::Pending),
        "Open" => Ok(PositionStatus::Open),
        "Closed" => Ok(PositionStatus::Closed),
        other => Err(format!("Invalid position status {}", other).into()),
    }
}

fn parse_close_reason(s: &str) -> Result<CloseReason> {
    [
        CloseReason::TakeProfit,
        CloseReason::StopLoss,
        CloseReason::TrailingStop,
        CloseReason::Timeout,
        CloseReason::Stagnation,
        CloseReason::WeakMomentum,
        CloseReason::Manual,
    ]
    .into_iter()
    .find(|r| r.as_str() == s)
    .ok_or_else(|| format!("Invalid close reason {}", s).into())
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    let num = |col: &str| -> std::result::Result<f64, sqlx::Error> {
        Ok(decimal_to_f64(row.try_get::<Decimal, _>(col)?))
    };
    let opt_num = |col: &str| -> std::result::Result<Option<f64>, sqlx::Error> {
        Ok(row.try_get::<Option<Decimal>, _>(col)?.map(decimal_to_f64))
    };

    let status: String = row.try_get("status")?;
    let close_reason: Option<String> = row.try_get("close_reason")?;

    Ok(Position {
        id: row.try_get::<Uuid, _>("id")?,
        symbol: row.try_get("symbol")?,
        entry_price: num("entry_price")?,
        quantity: num("quantity")?,
        stop_loss_price: num("stop_loss")?,
        take_profit_price: num("take_profit")?,
        trailing_activation_price: num("trailing_activation")?,
        trailing_stop_price: opt_num("trailing_stop")?,
        opened_at: row.try_get::<DateTime<Utc>, _>("opened_at")?,
        status: parse_status(&status)?,
        close_reason: close_reason.as_deref().map(parse_close_reason).transpose()?,
        exit_price: opt_num("exit_price")?,
        closed_at: row.try_get("closed_at")?,
        realized_pnl: opt_num("realized_pnl")?,
        estimated_fees: opt_num("estimated_fees")?,
        entry_order_id: row.try_get("entry_order_id")?,
        protective_order_list_id: row.try_get("protective_order_list_id")?,
    })
}
