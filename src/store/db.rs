//! Relational store over SQLite: per-mode order/fill/plan/position/ledger/pnl
//! families plus the shared trading-pair, strategy-config, and simulation
//! tables. Table names carry the `paper_`/`live_` prefix and no operation ever
//! crosses families.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Transaction};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::TradingPair;
use crate::models::{
    AccountType, ExecutionPlan, Fill, LedgerEntry, Order, OrderSide, OrderStatus, OrderType,
    PlanKind, PlanLeg, PlanStatus, PnlRecord, Position, TradingMode,
};
use crate::util::now_ms;

const MODES: [&str; 2] = ["paper", "live"];

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Fields for a new order row; ids and timestamps are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub leg_id: Option<String>,
    pub exchange_id: String,
    pub account_type: AccountType,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub client_order_id: Option<String>,
    pub external_order_id: Option<String>,
    pub metadata: Value,
}

/// Partial order update applied by the OMS after an execution or refresh.
#[derive(Debug, Clone)]
pub struct OrderStatusUpdate {
    pub status: OrderStatus,
    pub filled_quantity: Option<Decimal>,
    pub average_price: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_currency: Option<String>,
    pub external_order_id: Option<String>,
}

impl OrderStatusUpdate {
    /// Update only the status, leaving execution fields untouched.
    pub fn status_only(status: OrderStatus) -> Self {
        Self {
            status,
            filled_quantity: None,
            average_price: None,
            fee: None,
            fee_currency: None,
            external_order_id: None,
        }
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        for mode in MODES {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {mode}_orders (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    plan_id TEXT,
                    leg_id TEXT,
                    exchange_id TEXT NOT NULL,
                    account_type TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    side TEXT NOT NULL,
                    order_type TEXT NOT NULL,
                    quantity TEXT NOT NULL,
                    price TEXT,
                    status TEXT NOT NULL,
                    filled_quantity TEXT NOT NULL DEFAULT '0',
                    average_price TEXT,
                    fee TEXT NOT NULL DEFAULT '0',
                    fee_currency TEXT,
                    client_order_id TEXT,
                    external_order_id TEXT,
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    filled_at INTEGER
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_{mode}_orders_client
                    ON {mode}_orders(user_id, client_order_id)
                    WHERE client_order_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_{mode}_orders_plan
                    ON {mode}_orders(plan_id);

                CREATE TABLE IF NOT EXISTS {mode}_fills (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    order_id TEXT NOT NULL,
                    exchange_id TEXT NOT NULL,
                    account_type TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    price TEXT NOT NULL,
                    quantity TEXT NOT NULL,
                    fee TEXT NOT NULL DEFAULT '0',
                    fee_currency TEXT,
                    external_trade_id TEXT,
                    external_order_id TEXT,
                    raw TEXT NOT NULL DEFAULT '{{}}',
                    created_at INTEGER NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_{mode}_fills_trade
                    ON {mode}_fills(external_trade_id)
                    WHERE external_trade_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_{mode}_fills_order
                    ON {mode}_fills(order_id);

                CREATE TABLE IF NOT EXISTS {mode}_execution_plans (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    exchange_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    legs TEXT NOT NULL DEFAULT '[]',
                    error_message TEXT,
                    started_at INTEGER NOT NULL,
                    finished_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS {mode}_positions (
                    user_id TEXT NOT NULL,
                    exchange_id TEXT NOT NULL,
                    account_type TEXT NOT NULL,
                    instrument TEXT NOT NULL,
                    quantity TEXT NOT NULL,
                    avg_price TEXT,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (user_id, exchange_id, account_type, instrument)
                );

                CREATE TABLE IF NOT EXISTS {mode}_ledger_entries (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    exchange_id TEXT NOT NULL,
                    account_type TEXT NOT NULL,
                    asset TEXT NOT NULL,
                    delta TEXT NOT NULL,
                    ref_type TEXT NOT NULL,
                    ref_id TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{mode}_ledger_user
                    ON {mode}_ledger_entries(user_id, asset);

                CREATE TABLE IF NOT EXISTS {mode}_pnl (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    exchange_id TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    profit TEXT NOT NULL,
                    profit_rate TEXT,
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    created_at INTEGER NOT NULL
                );"
            ))?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trading_pairs (
                symbol TEXT PRIMARY KEY,
                base_currency TEXT NOT NULL,
                quote_currency TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                supported_exchanges TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS strategy_configs (
                strategy_type TEXT PRIMARY KEY,
                config TEXT NOT NULL DEFAULT '{}',
                is_enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS simulation_config (
                user_id TEXT PRIMARY KEY,
                quote_currency TEXT NOT NULL,
                current_balance TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Run `f` inside a single transaction. Used where a fill insert and its
    /// position/ledger projection must land together.
    pub(crate) async fn with_tx<R>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<R>,
    ) -> Result<R> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Insert a new order, returning its id. A duplicate
    /// `(user_id, client_order_id)` resolves to the existing order id.
    pub async fn create_order(&self, mode: TradingMode, new: &NewOrder) -> Result<Uuid> {
        let conn = self.conn.lock().await;
        if let Some(coid) = &new.client_order_id {
            if let Some(existing) = order_id_by_client(&conn, mode, new.user_id, coid)? {
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4();
        let now = now_ms();
        let table = mode.table("orders");
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {table} (
                    id, user_id, plan_id, leg_id, exchange_id, account_type, symbol,
                    side, order_type, quantity, price, status,
                    client_order_id, external_order_id, metadata, created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,'pending',?12,?13,?14,?15,?16)"
            ),
            params![
                id.to_string(),
                new.user_id.to_string(),
                new.plan_id.map(|p| p.to_string()),
                new.leg_id.as_deref(),
                new.exchange_id,
                new.account_type.as_str(),
                new.symbol,
                new.side.as_str(),
                new.order_type.as_str(),
                new.quantity.to_string(),
                new.price.map(|p| p.to_string()),
                new.client_order_id.as_deref(),
                new.external_order_id.as_deref(),
                new.metadata.to_string(),
                now,
                now,
            ],
        );

        match inserted {
            Ok(_) => Ok(id),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Raced another insert on the same client order id.
                if let Some(coid) = &new.client_order_id {
                    if let Some(existing) = order_id_by_client(&conn, mode, new.user_id, coid)? {
                        return Ok(existing);
                    }
                }
                Err(anyhow!("order insert constraint violation"))
            }
            Err(e) => Err(e).context("insert order"),
        }
    }

    pub async fn update_order_status(
        &self,
        mode: TradingMode,
        order_id: Uuid,
        update: &OrderStatusUpdate,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let table = mode.table("orders");
        let now = now_ms();
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = ?2,
                     filled_quantity = COALESCE(?3, filled_quantity),
                     average_price = COALESCE(?4, average_price),
                     fee = COALESCE(?5, fee),
                     fee_currency = COALESCE(?6, fee_currency),
                     external_order_id = COALESCE(?7, external_order_id),
                     filled_at = CASE WHEN ?2 = 'filled' THEN ?8 ELSE filled_at END,
                     updated_at = ?8
                 WHERE id = ?1"
            ),
            params![
                order_id.to_string(),
                update.status.as_str(),
                update.filled_quantity.map(|d| d.to_string()),
                update.average_price.map(|d| d.to_string()),
                update.fee.map(|d| d.to_string()),
                update.fee_currency.as_deref(),
                update.external_order_id.as_deref(),
                now,
            ],
        )
        .context("update order status")?;
        Ok(())
    }

    pub async fn get_order(&self, mode: TradingMode, order_id: Uuid) -> Result<Option<Order>> {
        let conn = self.conn.lock().await;
        get_order_sync(&conn, mode, order_id)
    }

    /// Plan orders in placement order.
    pub async fn get_orders_by_plan(
        &self,
        mode: TradingMode,
        user_id: Uuid,
        plan_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let conn = self.conn.lock().await;
        let table = mode.table("orders");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLUMNS} FROM {table}
             WHERE user_id = ?1 AND plan_id = ?2
             ORDER BY rowid ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![user_id.to_string(), plan_id.to_string(), limit as i64],
            order_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(order_from_raw(row?)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------

    pub async fn fill_exists(&self, mode: TradingMode, external_trade_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        fill_exists_sync(&conn, mode, external_trade_id)
    }

    pub async fn get_fills_for_orders(
        &self,
        mode: TradingMode,
        order_ids: &[Uuid],
    ) -> Result<Vec<Fill>> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        let table = mode.table("fills");
        let mut out = Vec::new();
        // Plan fan-out is small (<= a few legs); per-order queries keep the
        // statement cacheable.
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FILL_COLUMNS} FROM {table} WHERE order_id = ?1 ORDER BY rowid ASC"
        ))?;
        for oid in order_ids {
            let rows = stmt.query_map(params![oid.to_string()], fill_row)?;
            for row in rows {
                out.push(fill_from_raw(row?)?);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Execution plans
    // ------------------------------------------------------------------

    pub async fn create_plan(
        &self,
        mode: TradingMode,
        user_id: Uuid,
        exchange_id: &str,
        kind: PlanKind,
    ) -> Result<Uuid> {
        let conn = self.conn.lock().await;
        let id = Uuid::new_v4();
        let table = mode.table("execution_plans");
        conn.execute(
            &format!(
                "INSERT INTO {table} (id, user_id, exchange_id, kind, status, legs, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', '[]', ?5)"
            ),
            params![
                id.to_string(),
                user_id.to_string(),
                exchange_id,
                kind.as_str(),
                now_ms(),
            ],
        )
        .context("insert execution plan")?;
        Ok(id)
    }

    pub async fn get_plan(
        &self,
        mode: TradingMode,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<ExecutionPlan>> {
        let conn = self.conn.lock().await;
        let table = mode.table("execution_plans");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, user_id, exchange_id, kind, status, legs, error_message,
                    started_at, finished_at
             FROM {table} WHERE id = ?1 AND user_id = ?2"
        ))?;
        let mut rows = stmt.query(params![plan_id.to_string(), user_id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let legs_json: String = row.get(5)?;
        Ok(Some(ExecutionPlan {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            user_id: parse_uuid(&row.get::<_, String>(1)?)?,
            exchange_id: row.get(2)?,
            kind: PlanKind::from_str(&row.get::<_, String>(3)?).map_err(|e| anyhow!(e))?,
            status: PlanStatus::from_str(&row.get::<_, String>(4)?).map_err(|e| anyhow!(e))?,
            legs: serde_json::from_str(&legs_json).unwrap_or_default(),
            error_message: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
        }))
    }

    /// Transition plan status. Terminal statuses stamp `finished_at` once; an
    /// error message only overwrites when provided.
    pub async fn update_plan_status(
        &self,
        mode: TradingMode,
        plan_id: Uuid,
        status: PlanStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let table = mode.table("execution_plans");
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = ?2,
                     finished_at = CASE
                         WHEN ?2 IN ('completed','failed','cancelled')
                              AND finished_at IS NULL THEN ?4
                         ELSE finished_at END,
                     error_message = COALESCE(?3, error_message)
                 WHERE id = ?1"
            ),
            params![
                plan_id.to_string(),
                status.as_str(),
                error_message,
                now_ms(),
            ],
        )
        .context("update plan status")?;
        Ok(())
    }

    pub async fn get_plan_legs(&self, mode: TradingMode, plan_id: Uuid) -> Result<Vec<PlanLeg>> {
        let conn = self.conn.lock().await;
        let table = mode.table("execution_plans");
        let mut stmt =
            conn.prepare_cached(&format!("SELECT legs FROM {table} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![plan_id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(Vec::new());
        };
        let legs_json: String = row.get(0)?;
        Ok(serde_json::from_str(&legs_json).unwrap_or_default())
    }

    pub async fn set_plan_legs(
        &self,
        mode: TradingMode,
        plan_id: Uuid,
        legs: &[PlanLeg],
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let table = mode.table("execution_plans");
        conn.execute(
            &format!("UPDATE {table} SET legs = ?2 WHERE id = ?1"),
            params![plan_id.to_string(), serde_json::to_string(legs)?],
        )
        .context("set plan legs")?;
        Ok(())
    }

    pub async fn append_plan_leg(
        &self,
        mode: TradingMode,
        plan_id: Uuid,
        leg: PlanLeg,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let table = mode.table("execution_plans");
        let legs_json: Option<String> = tx
            .query_row(
                &format!("SELECT legs FROM {table} WHERE id = ?1"),
                params![plan_id.to_string()],
                |row| row.get(0),
            )
            .ok();
        let mut legs: Vec<PlanLeg> = legs_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default();
        legs.push(leg);
        tx.execute(
            &format!("UPDATE {table} SET legs = ?2 WHERE id = ?1"),
            params![plan_id.to_string(), serde_json::to_string(&legs)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Positions / ledger / pnl (read side; writes go through the projector tx)
    // ------------------------------------------------------------------

    pub async fn get_position(
        &self,
        mode: TradingMode,
        user_id: Uuid,
        exchange_id: &str,
        account_type: AccountType,
        instrument: &str,
    ) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        get_position_sync(&conn, mode, user_id, exchange_id, account_type, instrument)
    }

    pub async fn get_ledger_entries(
        &self,
        mode: TradingMode,
        user_id: Uuid,
    ) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let table = mode.table("ledger_entries");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, user_id, exchange_id, account_type, asset, delta,
                    ref_type, ref_id, metadata, created_at
             FROM {table} WHERE user_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, user, ex, acct, asset, delta, ref_type, ref_id, metadata, created_at) = row?;
            out.push(LedgerEntry {
                id: parse_uuid(&id)?,
                user_id: parse_uuid(&user)?,
                exchange_id: ex,
                account_type: AccountType::from_str(&acct).map_err(|e| anyhow!(e))?,
                asset,
                delta: parse_decimal(&delta)?,
                ref_type,
                ref_id: parse_uuid(&ref_id)?,
                metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
                created_at,
            });
        }
        Ok(out)
    }

    pub async fn insert_pnl(&self, mode: TradingMode, record: &PnlRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        let table = mode.table("pnl");
        conn.execute(
            &format!(
                "INSERT INTO {table} (id, user_id, exchange_id, symbol, profit, profit_rate,
                                      metadata, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"
            ),
            params![
                record.id.to_string(),
                record.user_id.to_string(),
                record.exchange_id,
                record.symbol,
                record.profit.to_string(),
                record.profit_rate.map(|d| d.to_string()),
                record.metadata.to_string(),
                record.created_at,
            ],
        )
        .context("insert pnl")?;
        Ok(())
    }

    pub async fn get_pnl(&self, mode: TradingMode, user_id: Uuid) -> Result<Vec<PnlRecord>> {
        let conn = self.conn.lock().await;
        let table = mode.table("pnl");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, user_id, exchange_id, symbol, profit, profit_rate, metadata, created_at
             FROM {table} WHERE user_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, user, ex, symbol, profit, profit_rate, metadata, created_at) = row?;
            out.push(PnlRecord {
                id: parse_uuid(&id)?,
                user_id: parse_uuid(&user)?,
                exchange_id: ex,
                symbol,
                profit: parse_decimal(&profit)?,
                profit_rate: profit_rate.as_deref().map(parse_decimal).transpose()?,
                metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
                created_at,
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Trading pairs / strategy configs / simulation balance
    // ------------------------------------------------------------------

    pub async fn upsert_pair(&self, pair: &TradingPair) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trading_pairs (symbol, base_currency, quote_currency, is_active,
                                        supported_exchanges)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(symbol) DO UPDATE SET
                is_active = excluded.is_active,
                supported_exchanges = excluded.supported_exchanges",
            params![
                pair.symbol,
                pair.base,
                pair.quote,
                pair.is_active as i64,
                serde_json::to_string(&pair.supported_exchanges)?,
            ],
        )
        .context("upsert trading pair")?;
        Ok(())
    }

    pub async fn get_pairs_for_exchange(
        &self,
        exchange_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<TradingPair>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, base_currency, quote_currency, is_active, supported_exchanges
             FROM trading_pairs ORDER BY symbol ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (symbol, base, quote, active, exchanges) = row?;
            let supported: Vec<String> = serde_json::from_str(&exchanges).unwrap_or_default();
            if !supported.is_empty() && !supported.iter().any(|e| e == exchange_id) {
                continue;
            }
            if enabled_only && active == 0 {
                continue;
            }
            out.push(TradingPair {
                symbol,
                base,
                quote,
                is_active: active != 0,
                supported_exchanges: supported,
            });
        }
        Ok(out)
    }

    pub async fn upsert_strategy_config(
        &self,
        strategy_type: &str,
        config: &Value,
        is_enabled: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_configs (strategy_type, config, is_enabled)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(strategy_type) DO UPDATE SET
                config = excluded.config,
                is_enabled = excluded.is_enabled",
            params![strategy_type, config.to_string(), is_enabled as i64],
        )
        .context("upsert strategy config")?;
        Ok(())
    }

    pub async fn get_strategy_configs(&self) -> Result<Vec<(String, Value, bool)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT strategy_type, config, is_enabled FROM strategy_configs")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (strategy_type, config, enabled) = row?;
            out.push((
                strategy_type,
                serde_json::from_str(&config).unwrap_or(Value::Null),
                enabled != 0,
            ));
        }
        Ok(out)
    }

    pub async fn set_simulation_config(
        &self,
        user_id: Uuid,
        quote_currency: &str,
        balance: Decimal,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO simulation_config (user_id, quote_currency, current_balance, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                quote_currency = excluded.quote_currency,
                current_balance = excluded.current_balance,
                updated_at = excluded.updated_at",
            params![
                user_id.to_string(),
                quote_currency,
                balance.to_string(),
                now_ms(),
            ],
        )
        .context("set simulation config")?;
        Ok(())
    }

    pub async fn get_simulation_balance(
        &self,
        user_id: Uuid,
    ) -> Result<Option<(String, Decimal)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT quote_currency, current_balance FROM simulation_config WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query(params![user_id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let quote: String = row.get(0)?;
        let balance: String = row.get(1)?;
        Ok(Some((quote, parse_decimal(&balance)?)))
    }
}

// ----------------------------------------------------------------------
// Row plumbing shared by async methods and the projector transaction.
// ----------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, user_id, plan_id, leg_id, exchange_id, account_type, symbol, \
     side, order_type, quantity, price, status, filled_quantity, average_price, fee, \
     fee_currency, client_order_id, external_order_id, metadata, created_at, updated_at, \
     filled_at";

const FILL_COLUMNS: &str = "id, user_id, order_id, exchange_id, account_type, symbol, price, \
     quantity, fee, fee_currency, external_trade_id, external_order_id, raw, created_at";

type RawOrder = (
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    i64,
    i64,
    Option<i64>,
);

fn order_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOrder> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
        row.get(19)?,
        row.get(20)?,
        row.get(21)?,
    ))
}

fn order_from_raw(raw: RawOrder) -> Result<Order> {
    let (
        id,
        user_id,
        plan_id,
        leg_id,
        exchange_id,
        account_type,
        symbol,
        side,
        order_type,
        quantity,
        price,
        status,
        filled_quantity,
        average_price,
        fee,
        fee_currency,
        client_order_id,
        external_order_id,
        metadata,
        created_at,
        updated_at,
        filled_at,
    ) = raw;
    Ok(Order {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        plan_id: plan_id.as_deref().map(parse_uuid).transpose()?,
        leg_id,
        exchange_id,
        account_type: AccountType::from_str(&account_type).map_err(|e| anyhow!(e))?,
        symbol,
        side: OrderSide::from_str(&side).map_err(|e| anyhow!(e))?,
        order_type: OrderType::from_str(&order_type).map_err(|e| anyhow!(e))?,
        quantity: parse_decimal(&quantity)?,
        price: price.as_deref().map(parse_decimal).transpose()?,
        status: OrderStatus::from_str(&status).map_err(|e| anyhow!(e))?,
        filled_quantity: parse_decimal(&filled_quantity)?,
        average_price: average_price.as_deref().map(parse_decimal).transpose()?,
        fee: parse_decimal(&fee)?,
        fee_currency,
        client_order_id,
        external_order_id,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at,
        updated_at,
        filled_at,
    })
}

type RawFill = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    i64,
);

fn fill_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFill> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn fill_from_raw(raw: RawFill) -> Result<Fill> {
    let (
        id,
        user_id,
        order_id,
        exchange_id,
        account_type,
        symbol,
        price,
        quantity,
        fee,
        fee_currency,
        external_trade_id,
        external_order_id,
        raw_payload,
        created_at,
    ) = raw;
    Ok(Fill {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        order_id: parse_uuid(&order_id)?,
        exchange_id,
        account_type: AccountType::from_str(&account_type).map_err(|e| anyhow!(e))?,
        symbol,
        price: parse_decimal(&price)?,
        quantity: parse_decimal(&quantity)?,
        fee: parse_decimal(&fee)?,
        fee_currency,
        external_trade_id,
        external_order_id,
        raw: serde_json::from_str(&raw_payload).unwrap_or(Value::Null),
        created_at,
    })
}

fn get_order_sync(conn: &Connection, mode: TradingMode, order_id: Uuid) -> Result<Option<Order>> {
    let table = mode.table("orders");
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ORDER_COLUMNS} FROM {table} WHERE id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![order_id.to_string()], order_row)?;
    match rows.next() {
        Some(row) => Ok(Some(order_from_raw(row?)?)),
        None => Ok(None),
    }
}

fn order_id_by_client(
    conn: &Connection,
    mode: TradingMode,
    user_id: Uuid,
    client_order_id: &str,
) -> Result<Option<Uuid>> {
    let table = mode.table("orders");
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id FROM {table} WHERE user_id = ?1 AND client_order_id = ?2 LIMIT 1"
    ))?;
    let mut rows = stmt.query(params![user_id.to_string(), client_order_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let id: String = row.get(0)?;
    Ok(Some(parse_uuid(&id)?))
}

fn fill_exists_sync(conn: &Connection, mode: TradingMode, external_trade_id: &str) -> Result<bool> {
    if external_trade_id.is_empty() {
        return Ok(false);
    }
    let table = mode.table("fills");
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT 1 FROM {table} WHERE external_trade_id = ?1 LIMIT 1"
    ))?;
    let mut rows = stmt.query(params![external_trade_id])?;
    Ok(rows.next()?.is_some())
}

pub(crate) fn insert_fill_tx(tx: &Transaction, mode: TradingMode, fill: &Fill) -> Result<()> {
    let table = mode.table("fills");
    tx.execute(
        &format!(
            "INSERT INTO {table} (id, user_id, order_id, exchange_id, account_type, symbol,
                                  price, quantity, fee, fee_currency, external_trade_id,
                                  external_order_id, raw, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"
        ),
        params![
            fill.id.to_string(),
            fill.user_id.to_string(),
            fill.order_id.to_string(),
            fill.exchange_id,
            fill.account_type.as_str(),
            fill.symbol,
            fill.price.to_string(),
            fill.quantity.to_string(),
            fill.fee.to_string(),
            fill.fee_currency.as_deref(),
            fill.external_trade_id.as_deref(),
            fill.external_order_id.as_deref(),
            fill.raw.to_string(),
            fill.created_at,
        ],
    )
    .context("insert fill")?;
    Ok(())
}

pub(crate) fn fill_exists_in_tx(
    tx: &Transaction,
    mode: TradingMode,
    external_trade_id: &str,
) -> Result<bool> {
    fill_exists_sync(tx, mode, external_trade_id)
}

fn get_position_sync(
    conn: &Connection,
    mode: TradingMode,
    user_id: Uuid,
    exchange_id: &str,
    account_type: AccountType,
    instrument: &str,
) -> Result<Option<Position>> {
    let table = mode.table("positions");
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT quantity, avg_price, updated_at FROM {table}
         WHERE user_id = ?1 AND exchange_id = ?2 AND account_type = ?3 AND instrument = ?4"
    ))?;
    let mut rows = stmt.query(params![
        user_id.to_string(),
        exchange_id,
        account_type.as_str(),
        instrument
    ])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let quantity: String = row.get(0)?;
    let avg_price: Option<String> = row.get(1)?;
    let updated_at: i64 = row.get(2)?;
    Ok(Some(Position {
        user_id,
        exchange_id: exchange_id.to_string(),
        account_type,
        instrument: instrument.to_string(),
        quantity: parse_decimal(&quantity)?,
        avg_price: avg_price.as_deref().map(parse_decimal).transpose()?,
        updated_at,
    }))
}

pub(crate) fn get_position_tx(
    tx: &Transaction,
    mode: TradingMode,
    user_id: Uuid,
    exchange_id: &str,
    account_type: AccountType,
    instrument: &str,
) -> Result<Option<Position>> {
    get_position_sync(tx, mode, user_id, exchange_id, account_type, instrument)
}

pub(crate) fn set_position_tx(
    tx: &Transaction,
    mode: TradingMode,
    user_id: Uuid,
    exchange_id: &str,
    account_type: AccountType,
    instrument: &str,
    quantity: Decimal,
    avg_price: Option<Decimal>,
) -> Result<()> {
    let table = mode.table("positions");
    tx.execute(
        &format!(
            "INSERT INTO {table} (user_id, exchange_id, account_type, instrument, quantity,
                                  avg_price, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(user_id, exchange_id, account_type, instrument) DO UPDATE SET
                quantity = excluded.quantity,
                avg_price = excluded.avg_price,
                updated_at = excluded.updated_at"
        ),
        params![
            user_id.to_string(),
            exchange_id,
            account_type.as_str(),
            instrument,
            quantity.to_string(),
            avg_price.map(|d| d.to_string()),
            now_ms(),
        ],
    )
    .context("upsert position")?;
    Ok(())
}

pub(crate) fn insert_ledger_tx(tx: &Transaction, mode: TradingMode, entry: &LedgerEntry) -> Result<()> {
    let table = mode.table("ledger_entries");
    tx.execute(
        &format!(
            "INSERT INTO {table} (id, user_id, exchange_id, account_type, asset, delta,
                                  ref_type, ref_id, metadata, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)"
        ),
        params![
            entry.id.to_string(),
            entry.user_id.to_string(),
            entry.exchange_id,
            entry.account_type.as_str(),
            entry.asset,
            entry.delta.to_string(),
            entry.ref_type,
            entry.ref_id.to_string(),
            entry.metadata.to_string(),
            entry.created_at,
        ],
    )
    .context("insert ledger entry")?;
    Ok(())
}

/// Apply `delta` to the simulation balance when the quote matches the
/// configured simulation quote currency. No-op otherwise.
pub(crate) fn adjust_simulation_balance_tx(
    tx: &Transaction,
    user_id: Uuid,
    quote_asset: &str,
    delta: Decimal,
) -> Result<()> {
    if delta == Decimal::ZERO {
        return Ok(());
    }
    let row: Option<(String, String)> = tx
        .query_row(
            "SELECT quote_currency, current_balance FROM simulation_config WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();
    let Some((quote, balance)) = row else {
        return Ok(());
    };
    if quote != quote_asset {
        return Ok(());
    }
    let new_balance = parse_decimal(&balance)? + delta;
    tx.execute(
        "UPDATE simulation_config SET current_balance = ?2, updated_at = ?3 WHERE user_id = ?1",
        params![user_id.to_string(), new_balance.to_string(), now_ms()],
    )?;
    Ok(())
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid uuid: {s}"))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("invalid decimal: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(user: Uuid, coid: Option<&str>) -> NewOrder {
        NewOrder {
            user_id: user,
            plan_id: None,
            leg_id: None,
            exchange_id: "binance".into(),
            account_type: AccountType::Spot,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: Decimal::ONE,
            price: None,
            client_order_id: coid.map(String::from),
            external_order_id: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inarbit.db");
        let path = path.to_str().unwrap();

        let user = Uuid::new_v4();
        let order_id = {
            let db = Database::open(path).unwrap();
            db.create_order(TradingMode::Paper, &new_order(user, Some("persist-1")))
                .await
                .unwrap()
        };

        let reopened = Database::open(path).unwrap();
        let order = reopened
            .get_order(TradingMode::Paper, order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.client_order_id.as_deref(), Some("persist-1"));
    }

    #[tokio::test]
    async fn duplicate_client_order_id_returns_existing() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let first = db
            .create_order(TradingMode::Paper, &new_order(user, Some("plan-spot")))
            .await
            .unwrap();
        let second = db
            .create_order(TradingMode::Paper, &new_order(user, Some("plan-spot")))
            .await
            .unwrap();
        assert_eq!(first, second);

        // Other user with the same client id gets its own order.
        let other = db
            .create_order(TradingMode::Paper, &new_order(Uuid::new_v4(), Some("plan-spot")))
            .await
            .unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn families_are_isolated() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let paper_id = db
            .create_order(TradingMode::Paper, &new_order(user, None))
            .await
            .unwrap();
        assert!(db
            .get_order(TradingMode::Live, paper_id)
            .await
            .unwrap()
            .is_none());
        assert!(db
            .get_order(TradingMode::Paper, paper_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn plan_status_stamps_finished_at_once() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let plan_id = db
            .create_plan(TradingMode::Paper, user, "binance", PlanKind::Basis)
            .await
            .unwrap();

        let plan = db
            .get_plan(TradingMode::Paper, user, plan_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Running);
        assert!(plan.finished_at.is_none());

        db.update_plan_status(TradingMode::Paper, plan_id, PlanStatus::Completed, None)
            .await
            .unwrap();
        let done = db
            .get_plan(TradingMode::Paper, user, plan_id)
            .await
            .unwrap()
            .unwrap();
        assert!(done.finished_at.is_some());

        let first_finish = done.finished_at;
        db.update_plan_status(TradingMode::Paper, plan_id, PlanStatus::Completed, None)
            .await
            .unwrap();
        let again = db
            .get_plan(TradingMode::Paper, user, plan_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.finished_at, first_finish);
    }

    #[tokio::test]
    async fn fill_unique_trade_id_is_enforced() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let order_id = db
            .create_order(TradingMode::Paper, &new_order(user, None))
            .await
            .unwrap();

        let fill = Fill {
            id: Uuid::new_v4(),
            user_id: user,
            order_id,
            exchange_id: "binance".into(),
            account_type: AccountType::Spot,
            symbol: "BTC/USDT".into(),
            price: Decimal::from(100),
            quantity: Decimal::ONE,
            fee: Decimal::ZERO,
            fee_currency: None,
            external_trade_id: Some("t-1".into()),
            external_order_id: None,
            raw: serde_json::json!({}),
            created_at: now_ms(),
        };
        db.with_tx(|tx| insert_fill_tx(tx, TradingMode::Paper, &fill))
            .await
            .unwrap();
        assert!(db.fill_exists(TradingMode::Paper, "t-1").await.unwrap());

        let dup = Fill {
            id: Uuid::new_v4(),
            ..fill.clone()
        };
        let res = db
            .with_tx(|tx| insert_fill_tx(tx, TradingMode::Paper, &dup))
            .await;
        assert!(res.is_err());
    }
}
