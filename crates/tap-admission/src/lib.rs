//! The tap admission boundary (spec §4.2): a pure, exhaustively-tested
//! regen/quota/reserve function, plus a Redis-Lua-script-backed engine that
//! runs the same arithmetic atomically in production.

pub mod engine;
pub mod metrics;
pub mod pure;

pub use engine::AdmissionEngine;
pub use pure::{
    tap, AdmissionConfig, AdmissionResult, DayPreState, PostState, PreState, Reason,
    ReservePreState, UserPreState,
};
