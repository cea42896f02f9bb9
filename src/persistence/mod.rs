//! SQLite trade repository.
//!
//! Stores one row per trade:
//! - prices as decimal TEXT
//! - timestamps as RFC 3339 TEXT
//! - the audit trail as a JSON column

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::market::{OptionContract, OptionType};
use crate::trade::{Trade, TradePatch, TradeRepository, TradeState, TradeUpdate};

const TRADE_COLUMNS: &str = "id, user_id, ticker, underlying, strike, expiry, option_type, state, \
     entry_price, entry_time, exit_price, exit_time, current_price, target_price, stop_loss, \
     confluence_score, updates, created_at, updated_at";

/// Raw column values, converted to a `Trade` outside the row callback.
struct TradeRow {
    id: String,
    user_id: String,
    ticker: String,
    underlying: String,
    strike: String,
    expiry: String,
    option_type: String,
    state: String,
    entry_price: Option<String>,
    entry_time: Option<String>,
    exit_price: Option<String>,
    exit_time: Option<String>,
    current_price: Option<String>,
    target_price: Option<String>,
    stop_loss: Option<String>,
    confluence_score: Option<f64>,
    updates: String,
    created_at: String,
    updated_at: String,
}

impl TradeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            ticker: row.get(2)?,
            underlying: row.get(3)?,
            strike: row.get(4)?,
            expiry: row.get(5)?,
            option_type: row.get(6)?,
            state: row.get(7)?,
            entry_price: row.get(8)?,
            entry_time: row.get(9)?,
            exit_price: row.get(10)?,
            exit_time: row.get(11)?,
            current_price: row.get(12)?,
            target_price: row.get(13)?,
            stop_loss: row.get(14)?,
            confluence_score: row.get(15)?,
            updates: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_trade(self) -> Result<Trade> {
        let option_type = match self.option_type.as_str() {
            "C" => OptionType::Call,
            "P" => OptionType::Put,
            other => return Err(anyhow!("unknown option type {:?} for trade {}", other, self.id)),
        };
        let contract = OptionContract::new(
            &self.underlying,
            parse_decimal(&self.strike)?,
            NaiveDate::parse_from_str(&self.expiry, "%Y-%m-%d")
                .with_context(|| format!("bad expiry for trade {}", self.id))?,
            option_type,
        );
        let state = TradeState::parse(&self.state)
            .ok_or_else(|| anyhow!("unknown state {:?} for trade {}", self.state, self.id))?;
        let updates: Vec<TradeUpdate> = serde_json::from_str(&self.updates)
            .with_context(|| format!("bad updates column for trade {}", self.id))?;

        let mut trade = Trade {
            id: self.id,
            user_id: self.user_id,
            ticker: self.ticker,
            contract,
            state,
            entry_price: parse_opt_decimal(self.entry_price)?,
            entry_time: parse_opt_time(self.entry_time)?,
            exit_price: parse_opt_decimal(self.exit_price)?,
            exit_time: parse_opt_time(self.exit_time)?,
            current_price: parse_opt_decimal(self.current_price)?,
            target_price: parse_opt_decimal(self.target_price)?,
            stop_loss: parse_opt_decimal(self.stop_loss)?,
            updates,
            move_pct: None,
            confluence_score: self.confluence_score,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        };
        trade.refresh_derived();
        Ok(trade)
    }
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("bad decimal {:?}", value))
}

fn parse_opt_decimal(value: Option<String>) -> Result<Option<Decimal>> {
    value.as_deref().map(parse_decimal).transpose()
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp {:?}", value))?
        .with_timezone(&Utc))
}

fn parse_opt_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

/// SQLite-backed `TradeRepository`.
pub struct SqliteTradeRepository {
    conn: Mutex<Connection>,
}

impl SqliteTradeRepository {
    /// Open the database, creating the schema if needed. `":memory:"` works for tests.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;

        info!("Trade repository initialized at {:?}", db_path.as_ref());
        Ok(repo)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("trade database lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                ticker TEXT NOT NULL,
                underlying TEXT NOT NULL,
                strike TEXT NOT NULL,
                expiry TEXT NOT NULL,
                option_type TEXT NOT NULL,
                state TEXT NOT NULL,
                entry_price TEXT,
                entry_time TEXT,
                exit_price TEXT,
                exit_time TEXT,
                current_price TEXT,
                target_price TEXT,
                stop_loss TEXT,
                confluence_score REAL,
                updates TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(user_id);
            CREATE INDEX IF NOT EXISTS idx_trades_state ON trades(state);
            "#,
        )?;

        debug!("Trade schema initialized");
        Ok(())
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Trade>> {
        let sql = format!("SELECT {} FROM trades WHERE id = ?1", TRADE_COLUMNS);
        conn.query_row(&sql, params![id], TradeRow::from_row)
            .optional()?
            .map(TradeRow::into_trade)
            .transpose()
    }

    fn write(conn: &Connection, trade: &Trade, insert_only: bool) -> Result<usize> {
        let verb = if insert_only { "INSERT" } else { "INSERT OR REPLACE" };
        let sql = format!(
            "{} INTO trades ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            verb, TRADE_COLUMNS
        );
        let dec = |d: Option<Decimal>| d.map(|v| v.to_string());
        let time = |t: Option<DateTime<Utc>>| t.map(|v| v.to_rfc3339());

        let rows = conn.execute(
            &sql,
            params![
                trade.id,
                trade.user_id,
                trade.ticker,
                trade.contract.underlying,
                trade.contract.strike.to_string(),
                trade.contract.expiry.format("%Y-%m-%d").to_string(),
                trade.contract.option_type.code().to_string(),
                trade.state.as_str(),
                dec(trade.entry_price),
                time(trade.entry_time),
                dec(trade.exit_price),
                time(trade.exit_time),
                dec(trade.current_price),
                dec(trade.target_price),
                dec(trade.stop_loss),
                trade.confluence_score,
                serde_json::to_string(&trade.updates)?,
                trade.created_at.to_rfc3339(),
                trade.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(rows)
    }

    /// Number of stored trades.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn list_trades(&self, user_id: &str) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM trades WHERE user_id = ?1 ORDER BY created_at",
            TRADE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], TradeRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(TradeRow::into_trade).collect()
    }

    async fn create(&self, trade: &Trade) -> Result<Trade> {
        let conn = self.conn()?;
        Self::write(&conn, trade, true)
            .with_context(|| format!("Failed to insert trade {}", trade.id))?;
        debug!(trade_id = %trade.id, "Trade inserted");
        Ok(trade.clone())
    }

    async fn update(&self, id: &str, patch: &TradePatch) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let mut trade = Self::load(&tx, id)?.ok_or_else(|| anyhow!("trade {} not found", id))?;
        patch.apply_to(&mut trade);
        trade.updated_at = Utc::now();
        Self::write(&tx, &trade, false)?;

        tx.commit()?;
        debug!(trade_id = %id, "Trade updated");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let rows = self
            .conn()?
            .execute("DELETE FROM trades WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(anyhow!("trade {} not found", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::{next_trade_id, TradeUpdateKind};
    use rust_decimal_macros::dec;

    fn trade() -> Trade {
        let contract = OptionContract::new(
            "AAPL",
            dec!(187.5),
            NaiveDate::from_ymd_opt(2099, 3, 20).unwrap(),
            OptionType::Put,
        );
        let mut trade = Trade::watching("user-1", contract, Utc::now())
            .with_levels(Some(dec!(6.40)), Some(dec!(2.10)));
        trade.state = TradeState::Loaded;
        trade
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let repo = SqliteTradeRepository::new(":memory:").unwrap();
        let original = trade();
        repo.create(&original).await.unwrap();

        let listed = repo.list_trades("user-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        let loaded = &listed[0];
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.contract, original.contract);
        assert_eq!(loaded.target_price, Some(dec!(6.40)));
        assert_eq!(loaded.state, TradeState::Loaded);

        assert!(repo.list_trades("someone-else").await.unwrap().is_empty());
        assert!(repo.create(&original).await.is_err());
    }

    #[tokio::test]
    async fn test_update_applies_patch() {
        let repo = SqliteTradeRepository::new(":memory:").unwrap();
        let original = trade();
        repo.create(&original).await.unwrap();

        let now = Utc::now();
        let patch = TradePatch::new()
            .state(TradeState::Entered)
            .entry(dec!(3.20), now)
            .append(TradeUpdate::new(TradeUpdateKind::Enter, dec!(3.20), now));
        repo.update(&original.id, &patch).await.unwrap();

        let loaded = repo.list_trades("user-1").await.unwrap().remove(0);
        assert_eq!(loaded.state, TradeState::Entered);
        assert_eq!(loaded.entry_price, Some(dec!(3.20)));
        assert_eq!(loaded.updates.len(), 1);
        assert_eq!(loaded.updates[0].kind, TradeUpdateKind::Enter);

        assert!(repo.update("missing", &patch).await.is_err());
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = SqliteTradeRepository::new(":memory:").unwrap();
        let original = trade();
        repo.create(&original).await.unwrap();

        repo.delete(&original.id).await.unwrap();
        assert_eq!(repo.count().unwrap(), 0);
        assert!(repo.delete(&original.id).await.is_err());
    }

    #[test]
    fn test_trades_survive_reopen() {
        let path = std::env::temp_dir().join(format!("cockpit-{}.db", next_trade_id(Utc::now())));
        let original = trade();

        {
            let repo = SqliteTradeRepository::new(&path).unwrap();
            tokio_test::assert_ok!(tokio_test::block_on(repo.create(&original)));
        }

        let reopened = SqliteTradeRepository::new(&path).unwrap();
        let listed = tokio_test::block_on(reopened.list_trades("user-1")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stop_loss, Some(dec!(2.10)));

        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }
}
