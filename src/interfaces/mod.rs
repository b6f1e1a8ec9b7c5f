//! Inbound adapters: the REST API and CSV import/export.

pub mod csv;
pub mod http;
