//! Postgres-backed [`crate::LedgerStore`] (spec §4.1, §6).
//!
//! Row-lock ordering follows spec §5: the system row is locked first
//! whenever an operation touches it, then user rows in ascending `user_id`
//! order.

use crate::types::{
    ApplyReport, DailyCounter, DailyDelta, LedgerKind, SystemState, TapEvent, User, UserDelta,
};
use crate::LedgerStore;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tap_common::{retry_with_backoff, Day, TapError, TapResult, TimeProvider, UserId};

/// Fallback energy cap for users created by a write path other than the
/// admission script (e.g. a direct `transfer` or `credit_from_reserve`
/// targeting a user the pipeline has never seen tap).
const DEFAULT_ENERGY_MAX: f64 = 1000.0;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS system_state (
        id SMALLINT PRIMARY KEY DEFAULT 1,
        total_supply BIGINT NOT NULL,
        reserve_supply BIGINT NOT NULL,
        reserved_supply BIGINT NOT NULL,
        initial_reserve BIGINT NOT NULL,
        admin_user_id BIGINT NOT NULL,
        admin_allocated BIGINT NOT NULL,
        start_rate DOUBLE PRECISION NOT NULL,
        min_rate DOUBLE PRECISION NOT NULL,
        referral_step INT NOT NULL,
        referral_bonus BIGINT NOT NULL,
        burned BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        CHECK (id = 1)
    )",
    "CREATE TABLE IF NOT EXISTS users (
        user_id BIGINT PRIMARY KEY,
        balance BIGINT NOT NULL DEFAULT 0,
        frozen_balance BIGINT NOT NULL DEFAULT 0,
        taps_total BIGINT NOT NULL DEFAULT 0,
        energy DOUBLE PRECISION NOT NULL DEFAULT 0,
        energy_max DOUBLE PRECISION NOT NULL DEFAULT 0,
        energy_updated_at BIGINT NOT NULL DEFAULT 0,
        energy_boost_until BIGINT NOT NULL DEFAULT 0,
        energy_boost_regen_mul DOUBLE PRECISION NOT NULL DEFAULT 1,
        energy_boost_max_mul DOUBLE PRECISION NOT NULL DEFAULT 1,
        referrals_count BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS referrals (
        referrer BIGINT NOT NULL,
        referred BIGINT UNIQUE NOT NULL,
        bonus BIGINT NOT NULL DEFAULT 0,
        ts BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS ledger (
        id BIGSERIAL PRIMARY KEY,
        event_id TEXT UNIQUE,
        ts BIGINT NOT NULL,
        kind TEXT NOT NULL,
        from_id BIGINT,
        to_id BIGINT,
        amount BIGINT NOT NULL,
        meta_json JSONB NOT NULL DEFAULT '{}'::jsonb
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_ts ON ledger (ts)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_from ON ledger (from_id)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_to ON ledger (to_id)",
    "CREATE TABLE IF NOT EXISTS user_daily (
        user_id BIGINT NOT NULL,
        day TEXT NOT NULL,
        tapped BIGINT NOT NULL DEFAULT 0,
        extra_quota BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, day)
    )",
    "CREATE TABLE IF NOT EXISTS invoices (
        invoice_id TEXT PRIMARY KEY,
        coins BIGINT NOT NULL,
        state TEXT NOT NULL,
        user_id BIGINT
    )",
];

fn db_err(e: sqlx::Error) -> TapError {
    TapError::Database(e.to_string())
}

pub struct PgLedgerStore {
    pool: PgPool,
    time: Arc<dyn TimeProvider>,
}

impl PgLedgerStore {
    pub async fn new(conn_str: &str, time: Arc<dyn TimeProvider>) -> TapResult<Self> {
        let options = PgPoolOptions::new().max_connections(16);
        let pool = retry_with_backoff(
            || options.clone().connect(conn_str),
            5,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .await
        .map_err(db_err)?;
        let store = Self { pool, time };
        store.bootstrap_schema().await?;
        Ok(store)
    }

    async fn bootstrap_schema(&self) -> TapResult<()> {
        for stmt in SCHEMA_STATEMENTS {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    /// Seeds the singleton system row, a no-op if it already exists.
    pub async fn bootstrap_system(
        &self,
        admin_user_id: UserId,
        initial_reserve: i64,
        admin_allocated: i64,
    ) -> TapResult<()> {
        let now = self.time.unix_seconds();
        let s = SystemState::bootstrap(admin_user_id, initial_reserve, admin_allocated, now);
        sqlx::query(
            "INSERT INTO system_state
             (id, total_supply, reserve_supply, reserved_supply, initial_reserve,
              admin_user_id, admin_allocated, start_rate, min_rate, referral_step,
              referral_bonus, burned, created_at, updated_at)
             VALUES (1, $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(s.total_supply)
        .bind(s.reserve_supply)
        .bind(s.reserved_supply)
        .bind(s.initial_reserve)
        .bind(s.admin_user_id.0 as i64)
        .bind(s.admin_allocated)
        .bind(s.start_rate)
        .bind(s.min_rate)
        .bind(s.referral_step as i32)
        .bind(s.referral_bonus)
        .bind(s.burned)
        .bind(s.created_at as i64)
        .bind(s.updated_at as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_ledger(
        &self,
        tx: &mut Transaction<'_, sqlx::Postgres>,
        event_id: Option<&str>,
        kind: LedgerKind,
        from_id: Option<UserId>,
        to_id: Option<UserId>,
        amount: i64,
        meta: serde_json::Value,
    ) -> TapResult<()> {
        let ts = self.time.unix_seconds() as i64;
        sqlx::query(
            "INSERT INTO ledger (event_id, ts, kind, from_id, to_id, amount, meta_json)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(event_id)
        .bind(ts)
        .bind(kind.as_str())
        .bind(from_id.map(|u| u.0 as i64))
        .bind(to_id.map(|u| u.0 as i64))
        .bind(amount)
        .bind(meta)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn lock_system_row(&self, tx: &mut Transaction<'_, sqlx::Postgres>) -> TapResult<(i64, i64)> {
        let row = sqlx::query("SELECT reserve_supply, reserved_supply FROM system_state WHERE id = 1 FOR UPDATE")
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok((row.get("reserve_supply"), row.get("reserved_supply")))
    }

    async fn lock_user_row(&self, tx: &mut Transaction<'_, sqlx::Postgres>, user: UserId) -> TapResult<i64> {
        sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(user.0 as i64)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM users WHERE user_id = $1")
            .bind(user.0 as i64)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(balance.unwrap_or(0))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn apply_tap_events(&self, batch: &[TapEvent]) -> TapResult<ApplyReport> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut accepted: Vec<&TapEvent> = Vec::new();
        for ev in batch {
            let meta = serde_json::json!({"taps": ev.taps, "req": ev.req, "day": ev.day.0});
            let inserted: Option<i64> = sqlx::query_scalar(
                "INSERT INTO ledger (event_id, ts, kind, from_id, to_id, amount, meta_json)
                 VALUES ($1,$2,$3,NULL,$4,$5,$6)
                 ON CONFLICT (event_id) DO NOTHING
                 RETURNING id",
            )
            .bind(&ev.event_id)
            .bind(ev.ts as i64)
            .bind(LedgerKind::Tap.as_str())
            .bind(ev.user_id.0 as i64)
            .bind(ev.coins)
            .bind(meta)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if inserted.is_some() {
                accepted.push(ev);
            }
        }

        let duplicates = batch.len() - accepted.len();
        if accepted.is_empty() {
            tx.commit().await.map_err(db_err)?;
            return Ok(ApplyReport { applied: 0, duplicates });
        }

        let reserve_sum: i64 = accepted.iter().map(|e| e.coins).sum();
        self.lock_system_row(&mut tx).await?;
        sqlx::query("UPDATE system_state SET reserve_supply = reserve_supply - $1 WHERE id = 1")
            .bind(reserve_sum)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut by_user: BTreeMap<u64, (i64, i64)> = BTreeMap::new();
        let mut by_day: BTreeMap<(u64, String), i64> = BTreeMap::new();
        for ev in &accepted {
            let entry = by_user.entry(ev.user_id.0).or_insert((0, 0));
            entry.0 += ev.coins;
            entry.1 += ev.taps;
            *by_day.entry((ev.user_id.0, ev.day.0.clone())).or_insert(0) += ev.taps;
        }

        for (uid, (coins, taps)) in by_user {
            sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
                .bind(uid as i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(
                "INSERT INTO users (user_id, balance, taps_total, energy_max)
                 VALUES ($1,$2,$3,$4)
                 ON CONFLICT (user_id) DO UPDATE SET
                    balance = users.balance + EXCLUDED.balance,
                    taps_total = users.taps_total + EXCLUDED.taps_total",
            )
            .bind(uid as i64)
            .bind(coins)
            .bind(taps)
            .bind(DEFAULT_ENERGY_MAX)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for ((uid, day), tapped) in by_day {
            sqlx::query(
                "INSERT INTO user_daily (user_id, day, tapped, extra_quota)
                 VALUES ($1,$2,$3,0)
                 ON CONFLICT (user_id, day) DO UPDATE SET tapped = user_daily.tapped + EXCLUDED.tapped",
            )
            .bind(uid as i64)
            .bind(day)
            .bind(tapped)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(ApplyReport { applied: accepted.len(), duplicates })
    }

    async fn apply_tap_aggregates(
        &self,
        users: &[UserDelta],
        daily: &[DailyDelta],
        reserve_delta: i64,
        source: &str,
    ) -> TapResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        self.lock_system_row(&mut tx).await?;
        sqlx::query("UPDATE system_state SET reserve_supply = reserve_supply + $1 WHERE id = 1")
            .bind(reserve_delta)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut sorted: Vec<&UserDelta> = users.iter().collect();
        sorted.sort_by_key(|u| u.user_id.0);
        for u in sorted {
            sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
                .bind(u.user_id.0 as i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(
                "INSERT INTO users (user_id, balance, taps_total, energy, energy_max, energy_updated_at)
                 VALUES ($1,$2,$3,$4,$5,$6)
                 ON CONFLICT (user_id) DO UPDATE SET
                    balance = users.balance + EXCLUDED.balance,
                    taps_total = users.taps_total + EXCLUDED.taps_total,
                    energy = EXCLUDED.energy,
                    energy_updated_at = EXCLUDED.energy_updated_at
                 WHERE users.energy_updated_at <= EXCLUDED.energy_updated_at",
            )
            .bind(u.user_id.0 as i64)
            .bind(u.balance_delta)
            .bind(u.taps_delta as i64)
            .bind(u.energy)
            .bind(DEFAULT_ENERGY_MAX)
            .bind(u.energy_updated_at as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for d in daily {
            sqlx::query(
                "INSERT INTO user_daily (user_id, day, tapped, extra_quota)
                 VALUES ($1,$2,$3,0)
                 ON CONFLICT (user_id, day) DO UPDATE SET tapped = user_daily.tapped + EXCLUDED.tapped",
            )
            .bind(d.user_id.0 as i64)
            .bind(&d.day.0)
            .bind(d.tapped_delta)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let total_taps: i64 = users.iter().map(|u| u.taps_delta as i64).sum();
        let total_coins: i64 = users.iter().map(|u| u.balance_delta).sum();
        let meta = serde_json::json!({
            "source": source,
            "users": users.len(),
            "total_taps": total_taps,
            "total_coins": total_coins,
        });
        self.append_ledger(&mut tx, None, LedgerKind::TapFlushBatch, None, None, total_coins, meta)
            .await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn credit_from_reserve(
        &self,
        user: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: serde_json::Value,
    ) -> TapResult<()> {
        if amount <= 0 {
            return Err(TapError::InvalidInput("amount must be positive".into()));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (reserve_supply, reserved_supply) = self.lock_system_row(&mut tx).await?;
        if reserve_supply - reserved_supply < amount {
            return Err(TapError::NotEnough(format!(
                "reserve has {} available, need {amount}",
                reserve_supply - reserved_supply
            )));
        }
        sqlx::query("UPDATE system_state SET reserve_supply = reserve_supply - $1 WHERE id = 1")
            .bind(amount)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        self.lock_user_row(&mut tx, user).await?;
        sqlx::query(
            "INSERT INTO users (user_id, balance, energy_max) VALUES ($1,$2,$3)
             ON CONFLICT (user_id) DO UPDATE SET balance = users.balance + EXCLUDED.balance",
        )
        .bind(user.0 as i64)
        .bind(amount)
        .bind(DEFAULT_ENERGY_MAX)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        self.append_ledger(&mut tx, None, kind, None, Some(user), amount, meta).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn debit_to_reserve(
        &self,
        user: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: serde_json::Value,
    ) -> TapResult<()> {
        if amount <= 0 {
            return Err(TapError::InvalidInput("amount must be positive".into()));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        self.lock_system_row(&mut tx).await?;
        let balance = self.lock_user_row(&mut tx, user).await?;
        if balance < amount {
            return Err(TapError::NotEnough(format!("balance {balance} < {amount}")));
        }
        sqlx::query("UPDATE users SET balance = balance - $1 WHERE user_id = $2")
            .bind(amount)
            .bind(user.0 as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE system_state SET reserve_supply = reserve_supply + $1 WHERE id = 1")
            .bind(amount)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        self.append_ledger(&mut tx, None, kind, Some(user), None, amount, meta).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn transfer(&self, from: UserId, to: UserId, amount: i64) -> TapResult<()> {
        if amount <= 0 {
            return Err(TapError::InvalidInput("amount must be positive".into()));
        }
        if from == to {
            return Err(TapError::Forbidden("cannot transfer to self".into()));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (first, second) = if from.0 < to.0 { (from, to) } else { (to, from) };
        let first_balance = self.lock_user_row(&mut tx, first).await?;
        let second_balance = self.lock_user_row(&mut tx, second).await?;
        let from_balance = if from == first { first_balance } else { second_balance };
        if from_balance < amount {
            return Err(TapError::NotEnough(format!("balance {from_balance} < {amount}")));
        }
        sqlx::query("UPDATE users SET balance = balance - $1 WHERE user_id = $2")
            .bind(amount)
            .bind(from.0 as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO users (user_id, balance, energy_max) VALUES ($1,$2,$3)
             ON CONFLICT (user_id) DO UPDATE SET balance = users.balance + EXCLUDED.balance",
        )
        .bind(to.0 as i64)
        .bind(amount)
        .bind(DEFAULT_ENERGY_MAX)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        self.append_ledger(&mut tx, None, LedgerKind::Transfer, Some(from), Some(to), amount, serde_json::json!({}))
            .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn burn(
        &self,
        user: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: serde_json::Value,
    ) -> TapResult<()> {
        if amount <= 0 {
            return Err(TapError::InvalidInput("amount must be positive".into()));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        self.lock_system_row(&mut tx).await?;
        let balance = self.lock_user_row(&mut tx, user).await?;
        if balance < amount {
            return Err(TapError::NotEnough(format!("balance {balance} < {amount}")));
        }
        sqlx::query("UPDATE users SET balance = balance - $1 WHERE user_id = $2")
            .bind(amount)
            .bind(user.0 as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE system_state SET total_supply = total_supply - $1, burned = burned + $1 WHERE id = 1")
            .bind(amount)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        self.append_ledger(&mut tx, None, kind, Some(user), None, amount, meta).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn register_referral(
        &self,
        referrer: UserId,
        referred: UserId,
        step: u32,
        bonus: i64,
    ) -> TapResult<i64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = self.time.unix_seconds() as i64;
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO referrals (referrer, referred, bonus, ts) VALUES ($1,$2,0,$3)
             ON CONFLICT (referred) DO NOTHING RETURNING referred",
        )
        .bind(referrer.0 as i64)
        .bind(referred.0 as i64)
        .bind(ts)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if inserted.is_none() {
            tx.commit().await.map_err(db_err)?;
            return Ok(0);
        }

        self.lock_user_row(&mut tx, referrer).await?;
        sqlx::query(
            "INSERT INTO users (user_id, referrals_count, energy_max) VALUES ($1,1,$2)
             ON CONFLICT (user_id) DO UPDATE SET referrals_count = users.referrals_count + 1",
        )
        .bind(referrer.0 as i64)
        .bind(DEFAULT_ENERGY_MAX)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let new_count: i64 = sqlx::query_scalar("SELECT referrals_count FROM users WHERE user_id = $1")
            .bind(referrer.0 as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut credited = 0i64;
        if step > 0 && new_count > 0 && new_count % step as i64 == 0 {
            let (reserve_supply, reserved_supply) = self.lock_system_row(&mut tx).await?;
            if reserve_supply - reserved_supply >= bonus {
                sqlx::query("UPDATE system_state SET reserve_supply = reserve_supply - $1 WHERE id = 1")
                    .bind(bonus)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                sqlx::query("UPDATE users SET balance = balance + $1 WHERE user_id = $2")
                    .bind(bonus)
                    .bind(referrer.0 as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                let meta = serde_json::json!({"step": step, "count": new_count});
                self.append_ledger(&mut tx, None, LedgerKind::RefBonus, None, Some(referrer), bonus, meta)
                    .await?;
                credited = bonus;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(credited)
    }

    async fn earmark_invoice(&self, invoice_id: &str, coins: i64) -> TapResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing: Option<String> = sqlx::query_scalar("SELECT state FROM invoices WHERE invoice_id = $1 FOR UPDATE")
            .bind(invoice_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if existing.is_some() {
            tx.commit().await.map_err(db_err)?;
            return Ok(());
        }
        let (reserve_supply, reserved_supply) = self.lock_system_row(&mut tx).await?;
        if reserve_supply - reserved_supply < coins {
            return Err(TapError::NotEnough(format!(
                "reserve headroom {} < {coins}",
                reserve_supply - reserved_supply
            )));
        }
        sqlx::query("UPDATE system_state SET reserved_supply = reserved_supply + $1 WHERE id = 1")
            .bind(coins)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("INSERT INTO invoices (invoice_id, coins, state, user_id) VALUES ($1,$2,'earmarked',NULL)")
            .bind(invoice_id)
            .bind(coins)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        self.append_ledger(
            &mut tx,
            None,
            LedgerKind::InvoiceEarmark,
            None,
            None,
            coins,
            serde_json::json!({"invoice_id": invoice_id}),
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn confirm_invoice(&self, invoice_id: &str, user: UserId) -> TapResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT coins, state FROM invoices WHERE invoice_id = $1 FOR UPDATE")
            .bind(invoice_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| TapError::NotFound(format!("invoice {invoice_id}")))?;
        let state: String = row.get("state");
        if state != "earmarked" {
            tx.commit().await.map_err(db_err)?;
            return Ok(());
        }
        let coins: i64 = row.get("coins");
        self.lock_system_row(&mut tx).await?;
        sqlx::query(
            "UPDATE system_state SET reserve_supply = reserve_supply - $1, reserved_supply = reserved_supply - $1 WHERE id = 1",
        )
        .bind(coins)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        self.lock_user_row(&mut tx, user).await?;
        sqlx::query(
            "INSERT INTO users (user_id, balance, energy_max) VALUES ($1,$2,$3)
             ON CONFLICT (user_id) DO UPDATE SET balance = users.balance + EXCLUDED.balance",
        )
        .bind(user.0 as i64)
        .bind(coins)
        .bind(DEFAULT_ENERGY_MAX)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE invoices SET state = 'confirmed', user_id = $1 WHERE invoice_id = $2")
            .bind(user.0 as i64)
            .bind(invoice_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        self.append_ledger(
            &mut tx,
            None,
            LedgerKind::InvoiceConfirm,
            None,
            Some(user),
            coins,
            serde_json::json!({"invoice_id": invoice_id}),
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn release_invoice(&self, invoice_id: &str) -> TapResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT coins, state FROM invoices WHERE invoice_id = $1 FOR UPDATE")
            .bind(invoice_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| TapError::NotFound(format!("invoice {invoice_id}")))?;
        let state: String = row.get("state");
        if state != "earmarked" {
            tx.commit().await.map_err(db_err)?;
            return Ok(());
        }
        let coins: i64 = row.get("coins");
        self.lock_system_row(&mut tx).await?;
        sqlx::query("UPDATE system_state SET reserved_supply = reserved_supply - $1 WHERE id = 1")
            .bind(coins)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE invoices SET state = 'released' WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        self.append_ledger(
            &mut tx,
            None,
            LedgerKind::InvoiceRelease,
            None,
            None,
            coins,
            serde_json::json!({"invoice_id": invoice_id}),
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_user(&self, user: UserId) -> TapResult<Option<User>> {
        let row = sqlx::query(
            "SELECT user_id, balance, frozen_balance, taps_total, energy, energy_max,
                    energy_updated_at, energy_boost_until, energy_boost_regen_mul,
                    energy_boost_max_mul, referrals_count
             FROM users WHERE user_id = $1",
        )
        .bind(user.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|row| User {
            user_id: UserId(row.get::<i64, _>("user_id") as u64),
            balance: row.get("balance"),
            frozen_balance: row.get("frozen_balance"),
            taps_total: row.get::<i64, _>("taps_total") as u64,
            energy: row.get("energy"),
            energy_max: row.get("energy_max"),
            energy_updated_at: row.get::<i64, _>("energy_updated_at") as u64,
            energy_boost_until: row.get::<i64, _>("energy_boost_until") as u64,
            energy_boost_regen_mul: row.get("energy_boost_regen_mul"),
            energy_boost_max_mul: row.get("energy_boost_max_mul"),
            referrals_count: row.get::<i64, _>("referrals_count") as u64,
        }))
    }

    async fn get_system_state(&self) -> TapResult<SystemState> {
        let row = sqlx::query("SELECT * FROM system_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| TapError::NotFound("system_state not bootstrapped".into()))?;
        Ok(SystemState {
            total_supply: row.get("total_supply"),
            reserve_supply: row.get("reserve_supply"),
            reserved_supply: row.get("reserved_supply"),
            initial_reserve: row.get("initial_reserve"),
            admin_user_id: UserId(row.get::<i64, _>("admin_user_id") as u64),
            admin_allocated: row.get("admin_allocated"),
            start_rate: row.get("start_rate"),
            min_rate: row.get("min_rate"),
            referral_step: row.get::<i32, _>("referral_step") as u32,
            referral_bonus: row.get("referral_bonus"),
            burned: row.get("burned"),
            created_at: row.get::<i64, _>("created_at") as u64,
            updated_at: row.get::<i64, _>("updated_at") as u64,
        })
    }

    async fn get_daily_counter(&self, user: UserId, day: &Day) -> TapResult<DailyCounter> {
        let row = sqlx::query("SELECT tapped, extra_quota FROM user_daily WHERE user_id = $1 AND day = $2")
            .bind(user.0 as i64)
            .bind(&day.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row
            .map(|row| DailyCounter { tapped: row.get("tapped"), extra_quota: row.get("extra_quota") })
            .unwrap_or_default())
    }
}
