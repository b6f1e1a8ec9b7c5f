//! Application layer orchestrating the settlement flow.
//!
//! `SettlementEngine` is the entry point. It wires the payment gateway, the
//! step-up gate, the voucher service, the reconciler and the redemption
//! service over the store ports in `domain::ports`.

pub mod engine;
pub mod gateway;
pub mod reconciler;
pub mod redemption;
pub mod step_up;
pub mod vouchers;
