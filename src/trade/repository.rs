//! Remote trade repository seam.
//!
//! The repository is the source of truth on load. The store writes through to
//! it after each local mutation.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::types::{Trade, TradePatch};

/// CRUD-style trade storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// All trades owned by a user.
    async fn list_trades(&self, user_id: &str) -> Result<Vec<Trade>>;

    /// Persist a new trade and return the stored record.
    async fn create(&self, trade: &Trade) -> Result<Trade>;

    /// Apply a partial update.
    async fn update(&self, id: &str, patch: &TradePatch) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// In-memory repository for paper mode and tests.
#[derive(Clone, Default)]
pub struct InMemoryTradeRepository {
    trades: Arc<RwLock<Vec<Trade>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryTradeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing records.
    pub fn with_trades(trades: Vec<Trade>) -> Self {
        Self {
            trades: Arc::new(RwLock::new(trades)),
            fail_writes: Arc::default(),
        }
    }

    /// Make create/update/delete fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Replace a stored record wholesale (simulates another client's edit).
    pub async fn put(&self, trade: Trade) {
        let mut trades = self.trades.write().await;
        match trades.iter_mut().find(|t| t.id == trade.id) {
            Some(existing) => *existing = trade,
            None => trades.push(trade),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Trade> {
        self.trades.read().await.iter().find(|t| t.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.trades.read().await.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("repository unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TradeRepository for InMemoryTradeRepository {
    async fn list_trades(&self, user_id: &str) -> Result<Vec<Trade>> {
        Ok(self
            .trades
            .read()
            .await
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create(&self, trade: &Trade) -> Result<Trade> {
        self.check_writable()?;
        let mut trades = self.trades.write().await;
        if trades.iter().any(|t| t.id == trade.id) {
            return Err(anyhow!("trade {} already exists", trade.id));
        }
        trades.push(trade.clone());
        debug!(trade_id = %trade.id, "Created trade");
        Ok(trade.clone())
    }

    async fn update(&self, id: &str, patch: &TradePatch) -> Result<()> {
        self.check_writable()?;
        let mut trades = self.trades.write().await;
        let trade = trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("trade {} not found", id))?;
        patch.apply_to(trade);
        trade.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let mut trades = self.trades.write().await;
        let before = trades.len();
        trades.retain(|t| t.id != id);
        if trades.len() == before {
            return Err(anyhow!("trade {} not found", id));
        }
        Ok(())
    }
}
