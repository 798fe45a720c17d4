//! PostgreSQL order store implementation
//!
//! Compare-and-set is expressed as `UPDATE ... WHERE status = $expected`;
//! the confirm-and-match step runs inside one SQL transaction holding a row
//! lock on the settlement transaction.

use async_trait::async_trait;
use chrono::Utc;
use common::{Currency, OrderId, TransactionId, UserId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::error::{SettlementError, SettlementResult};
use crate::store::traits::OrderStore;
use crate::types::{
    ConfirmOutcome, MonitorKind, Order, OrderStatus, Transaction, TransactionStatus,
};

const ORDER_COLUMNS: &str = "order_id, user_id, order_type, amount, price, currency, status, \
     fault_reason, retry_pending, counter_leg_attempts, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "transaction_id, order_id, user_id, kind, amount, status, \
     external_ref, counter_leg_key, created_at, updated_at, confirmed_at";

fn storage_err(e: sqlx::Error) -> SettlementError {
    SettlementError::Storage(e.to_string())
}

fn decode_err(column: &str, e: impl std::fmt::Display) -> SettlementError {
    SettlementError::Storage(format!("Failed to decode column '{}': {}", column, e))
}

/// PostgreSQL order store
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Connect with a fresh pool
    pub async fn connect(database_url: &str, max_connections: u32) -> SettlementResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| SettlementError::Storage(format!("Failed to connect to database: {}", e)))?;

        info!(max_connections, "Connected to PostgreSQL settlement store");
        Ok(Self { pool })
    }

    /// Create from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled migration SQL
    pub async fn run_migrations(&self) -> SettlementResult<()> {
        let migration_sql = include_str!("../../migrations/001_create_settlement.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&self.pool)
            .await
            .map_err(|e| SettlementError::Storage(format!("Migration failed: {}", e)))?;
        info!("Settlement migrations completed successfully");
        Ok(())
    }

    fn row_to_order(row: &PgRow) -> SettlementResult<Order> {
        let order_type: String = row.try_get("order_type").map_err(storage_err)?;
        let status: String = row.try_get("status").map_err(storage_err)?;
        let currency: String = row.try_get("currency").map_err(storage_err)?;
        let attempts: i32 = row.try_get("counter_leg_attempts").map_err(storage_err)?;

        Ok(Order {
            order_id: OrderId::from_uuid(row.try_get("order_id").map_err(storage_err)?),
            user_id: UserId::from_uuid(row.try_get("user_id").map_err(storage_err)?),
            order_type: order_type.parse().map_err(|e| decode_err("order_type", e))?,
            amount: row.try_get("amount").map_err(storage_err)?,
            price: row.try_get("price").map_err(storage_err)?,
            currency: Currency::new(currency),
            status: status.parse().map_err(|e| decode_err("status", e))?,
            fault_reason: row.try_get("fault_reason").map_err(storage_err)?,
            retry_pending: row.try_get("retry_pending").map_err(storage_err)?,
            counter_leg_attempts: u32::try_from(attempts)
                .map_err(|e| decode_err("counter_leg_attempts", e))?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
            updated_at: row.try_get("updated_at").map_err(storage_err)?,
        })
    }

    fn row_to_transaction(row: &PgRow) -> SettlementResult<Transaction> {
        let kind: String = row.try_get("kind").map_err(storage_err)?;
        let status: String = row.try_get("status").map_err(storage_err)?;

        Ok(Transaction {
            transaction_id: TransactionId(row.try_get("transaction_id").map_err(storage_err)?),
            order_id: OrderId::from_uuid(row.try_get("order_id").map_err(storage_err)?),
            user_id: UserId::from_uuid(row.try_get("user_id").map_err(storage_err)?),
            kind: kind.parse::<MonitorKind>().map_err(|e| decode_err("kind", e))?,
            amount: row.try_get("amount").map_err(storage_err)?,
            status: status
                .parse::<TransactionStatus>()
                .map_err(|e| decode_err("status", e))?,
            external_ref: row.try_get("external_ref").map_err(storage_err)?,
            counter_leg_key: row.try_get("counter_leg_key").map_err(storage_err)?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
            updated_at: row.try_get("updated_at").map_err(storage_err)?,
            confirmed_at: row.try_get("confirmed_at").map_err(storage_err)?,
        })
    }

    /// Distinguish "order missing" from "order in another state" after a
    /// conditional update matched no row.
    async fn transition_conflict(
        &self,
        order_id: OrderId,
        to: OrderStatus,
    ) -> SettlementError {
        match self.get_order(order_id).await {
            Ok(Some(current)) => SettlementError::InvalidStateTransition {
                order_id,
                from: current.status,
                to,
            },
            Ok(None) => SettlementError::order_not_found(order_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create_order(&self, order: Order) -> SettlementResult<Order> {
        sqlx::query(
            r#"
            INSERT INTO settlement_orders (
                order_id, user_id, order_type, amount, price, currency, status,
                fault_reason, retry_pending, counter_leg_attempts, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.order_id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(order.order_type.as_str())
        .bind(order.amount)
        .bind(order.price)
        .bind(order.currency.as_str())
        .bind(order.status.as_str())
        .bind(&order.fault_reason)
        .bind(order.retry_pending)
        .bind(order.counter_leg_attempts as i32)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(order)
    }

    async fn get_order(&self, order_id: OrderId) -> SettlementResult<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM settlement_orders WHERE order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn list_orders(&self, statuses: Option<Vec<OrderStatus>>) -> SettlementResult<Vec<Order>> {
        let rows = match statuses {
            Some(statuses) => {
                let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
                sqlx::query(&format!(
                    "SELECT {} FROM settlement_orders WHERE status = ANY($1) ORDER BY created_at ASC",
                    ORDER_COLUMNS
                ))
                .bind(names)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM settlement_orders ORDER BY created_at ASC",
                    ORDER_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn create_transaction(&self, transaction: Transaction) -> SettlementResult<Transaction> {
        sqlx::query(
            r#"
            INSERT INTO settlement_transactions (
                transaction_id, order_id, user_id, kind, amount, status,
                external_ref, counter_leg_key, created_at, updated_at, confirmed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(transaction.transaction_id.as_uuid())
        .bind(transaction.order_id.as_uuid())
        .bind(transaction.user_id.as_uuid())
        .bind(transaction.kind.as_str())
        .bind(transaction.amount)
        .bind(transaction.status.as_str())
        .bind(&transaction.external_ref)
        .bind(&transaction.counter_leg_key)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .bind(transaction.confirmed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.get_transaction(transaction.order_id)
            .await?
            .ok_or_else(|| SettlementError::transaction_not_found(transaction.order_id))
    }

    async fn get_transaction(&self, order_id: OrderId) -> SettlementResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM settlement_transactions WHERE order_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn list_pending_transactions(&self) -> SettlementResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM settlement_transactions WHERE status = 'pending' ORDER BY created_at ASC",
            TRANSACTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn set_external_ref(
        &self,
        order_id: OrderId,
        external_ref: &str,
    ) -> SettlementResult<Transaction> {
        let row = sqlx::query(&format!(
            "UPDATE settlement_transactions SET external_ref = $2, updated_at = $3 \
             WHERE order_id = $1 RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .bind(external_ref)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => Self::row_to_transaction(&row),
            None => Err(SettlementError::transaction_not_found(order_id)),
        }
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        fault_reason: Option<String>,
    ) -> SettlementResult<Order> {
        if !from.can_transition_to(to) {
            return Err(self.transition_conflict(order_id, to).await);
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE settlement_orders SET
                status = $3,
                updated_at = $4,
                retry_pending = CASE WHEN $3 = 'matched' THEN retry_pending ELSE FALSE END,
                fault_reason = CASE
                    WHEN $5::TEXT IS NOT NULL THEN $5::TEXT
                    WHEN $3 = 'completed' THEN NULL
                    ELSE fault_reason
                END
            WHERE order_id = $1 AND status = $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(fault_reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => Self::row_to_order(&row),
            None => Err(self.transition_conflict(order_id, to).await),
        }
    }

    async fn confirm_and_match(&self, order_id: OrderId) -> SettlementResult<ConfirmOutcome> {
        let mut db_tx = self.pool.begin().await.map_err(storage_err)?;

        let tx_row = sqlx::query(&format!(
            "SELECT {} FROM settlement_transactions WHERE order_id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(storage_err)?
        .ok_or_else(|| SettlementError::transaction_not_found(order_id))?;
        let transaction = Self::row_to_transaction(&tx_row)?;

        if transaction.is_confirmed() {
            let order_row = sqlx::query(&format!(
                "SELECT {} FROM settlement_orders WHERE order_id = $1",
                ORDER_COLUMNS
            ))
            .bind(order_id.as_uuid())
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| SettlementError::order_not_found(order_id))?;
            let order = Self::row_to_order(&order_row)?;
            db_tx.commit().await.map_err(storage_err)?;
            return Ok(ConfirmOutcome::AlreadyConfirmed { order, transaction });
        }

        let now = Utc::now();
        let order_row = sqlx::query(&format!(
            "UPDATE settlement_orders SET status = 'matched', updated_at = $2 \
             WHERE order_id = $1 AND status = 'pending' RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .bind(now)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(storage_err)?;

        let order = match order_row {
            Some(row) => Self::row_to_order(&row)?,
            None => {
                db_tx.rollback().await.map_err(storage_err)?;
                return Err(self.transition_conflict(order_id, OrderStatus::Matched).await);
            }
        };

        let tx_row = sqlx::query(&format!(
            "UPDATE settlement_transactions SET status = 'confirmed', confirmed_at = $2, updated_at = $2 \
             WHERE order_id = $1 RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .bind(now)
        .fetch_one(&mut *db_tx)
        .await
        .map_err(storage_err)?;
        let transaction = Self::row_to_transaction(&tx_row)?;

        db_tx.commit().await.map_err(storage_err)?;
        Ok(ConfirmOutcome::Confirmed { order, transaction })
    }

    async fn set_counter_leg_key(
        &self,
        order_id: OrderId,
        key: &str,
    ) -> SettlementResult<Transaction> {
        sqlx::query(
            "UPDATE settlement_transactions SET counter_leg_key = $2, updated_at = $3 \
             WHERE order_id = $1 AND counter_leg_key IS DISTINCT FROM $2",
        )
        .bind(order_id.as_uuid())
        .bind(key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.get_transaction(order_id)
            .await?
            .ok_or_else(|| SettlementError::transaction_not_found(order_id))
    }

    async fn record_fault(&self, order_id: OrderId, reason: &str) -> SettlementResult<Order> {
        let row = sqlx::query(&format!(
            "UPDATE settlement_orders SET fault_reason = $2, updated_at = $3, \
             retry_pending = (status = 'matched') OR retry_pending \
             WHERE order_id = $1 RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .bind(reason)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => Self::row_to_order(&row),
            None => Err(SettlementError::order_not_found(order_id)),
        }
    }

    async fn record_counter_leg_failure(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> SettlementResult<Order> {
        let row = sqlx::query(&format!(
            "UPDATE settlement_orders SET fault_reason = $2, updated_at = $3, \
             counter_leg_attempts = counter_leg_attempts + 1, \
             retry_pending = (status = 'matched') OR retry_pending \
             WHERE order_id = $1 RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(order_id.as_uuid())
        .bind(reason)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => Self::row_to_order(&row),
            None => Err(SettlementError::order_not_found(order_id)),
        }
    }
}
