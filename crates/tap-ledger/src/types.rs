use serde::{Deserialize, Serialize};
use tap_common::{Day, UserId};

pub use tap_common::TapEvent;

/// The singleton system row (spec §3). Invariant:
/// `reserve_supply >= reserved_supply >= 0` and
/// `total_supply == reserve_supply + sum(user.balance) + sum(frozen) + burned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub total_supply: i64,
    pub reserve_supply: i64,
    pub reserved_supply: i64,
    pub initial_reserve: i64,
    pub admin_user_id: UserId,
    pub admin_allocated: i64,
    pub start_rate: f64,
    pub min_rate: f64,
    pub referral_step: u32,
    pub referral_bonus: i64,
    pub burned: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SystemState {
    /// Bootstraps the singleton row on first run (spec §6).
    pub fn bootstrap(
        admin_user_id: UserId,
        initial_reserve: i64,
        admin_allocated: i64,
        now: u64,
    ) -> Self {
        SystemState {
            total_supply: initial_reserve + admin_allocated,
            reserve_supply: initial_reserve,
            reserved_supply: 0,
            initial_reserve,
            admin_user_id,
            admin_allocated,
            start_rate: 1.0,
            min_rate: 0.1,
            referral_step: 3,
            referral_bonus: 10,
            burned: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-user durable state (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub balance: i64,
    pub frozen_balance: i64,
    pub taps_total: u64,
    pub energy: f64,
    pub energy_max: f64,
    pub energy_updated_at: u64,
    pub energy_boost_until: u64,
    pub energy_boost_regen_mul: f64,
    pub energy_boost_max_mul: f64,
    pub referrals_count: u64,
}

impl User {
    /// Default shape for a user seen for the first time (spec §3: "Created
    /// on first contact; never deleted").
    pub fn new(user_id: UserId, energy_max_default: f64, now: u64) -> Self {
        User {
            user_id,
            balance: 0,
            frozen_balance: 0,
            taps_total: 0,
            energy: energy_max_default,
            energy_max: energy_max_default,
            energy_updated_at: now,
            energy_boost_until: 0,
            energy_boost_regen_mul: 1.0,
            energy_boost_max_mul: 1.0,
            referrals_count: 0,
        }
    }
}

/// Key `(user_id, day)` counter (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyCounter {
    pub tapped: i64,
    pub extra_quota: i64,
}

/// Ledger row kind (spec §3, §9 — modeled as a tagged union rather than a
/// loose string-keyed map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Tap,
    TapFlushBatch,
    CreditReserve,
    DebitReserve,
    Transfer,
    RefBonus,
    Burn,
    InvoiceEarmark,
    InvoiceConfirm,
    InvoiceRelease,
    DepositCredit,
    LoanDebit,
    MarketTransfer,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Tap => "tap",
            LedgerKind::TapFlushBatch => "tap_flush_batch",
            LedgerKind::CreditReserve => "credit_reserve",
            LedgerKind::DebitReserve => "debit_reserve",
            LedgerKind::Transfer => "transfer",
            LedgerKind::RefBonus => "ref_bonus",
            LedgerKind::Burn => "burn",
            LedgerKind::InvoiceEarmark => "invoice_earmark",
            LedgerKind::InvoiceConfirm => "invoice_confirm",
            LedgerKind::InvoiceRelease => "invoice_release",
            LedgerKind::DepositCredit => "deposit_credit",
            LedgerKind::LoanDebit => "loan_debit",
            LedgerKind::MarketTransfer => "market_transfer",
        }
    }
}

/// Append-only ledger row (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub event_id: Option<String>,
    pub ts: u64,
    pub kind: LedgerKind,
    pub from_id: Option<UserId>,
    pub to_id: Option<UserId>,
    pub amount: i64,
    pub meta: serde_json::Value,
}

/// Pre-summed per-user delta, used by `apply_tap_aggregates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDelta {
    pub user_id: UserId,
    pub balance_delta: i64,
    pub taps_delta: u64,
    pub energy: f64,
    pub energy_updated_at: u64,
}

/// Pre-summed per-`(user, day)` delta, used by `apply_tap_aggregates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDelta {
    pub user_id: UserId,
    pub day: Day,
    pub tapped_delta: i64,
}

/// Two-phase reserve earmark lifecycle state for an invoice (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceState {
    Earmarked,
    Confirmed,
    Released,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_sets_total_supply_to_reserve_plus_admin_allocation() {
        let s = SystemState::bootstrap(UserId(1), 1_000_000, 500, 0);
        assert_eq!(s.total_supply, 1_000_500);
        assert_eq!(s.reserve_supply, 1_000_000);
        assert_eq!(s.reserved_supply, 0);
    }

    #[test]
    fn ledger_kind_round_trips_through_serde() {
        for kind in [
            LedgerKind::Tap,
            LedgerKind::TapFlushBatch,
            LedgerKind::CreditReserve,
            LedgerKind::DebitReserve,
            LedgerKind::Transfer,
            LedgerKind::RefBonus,
            LedgerKind::Burn,
            LedgerKind::InvoiceEarmark,
            LedgerKind::InvoiceConfirm,
            LedgerKind::InvoiceRelease,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: LedgerKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn new_user_starts_at_full_energy_with_zero_balance() {
        let u = User::new(UserId(9), 1000.0, 42);
        assert_eq!(u.balance, 0);
        assert_eq!(u.taps_total, 0);
        assert_eq!(u.energy, 1000.0);
        assert_eq!(u.energy_max, 1000.0);
        assert_eq!(u.energy_updated_at, 42);
    }
}
