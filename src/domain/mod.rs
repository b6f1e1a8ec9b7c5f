//! Domain types and the ports the application layer drives.

pub mod budget;
pub mod ports;
pub mod provider;
pub mod rail;
pub mod redemption;
pub mod step_up;
pub mod transaction;
pub mod voucher;
