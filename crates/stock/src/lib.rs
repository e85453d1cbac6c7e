//! `billflow-stock` — remote inventory decrement for paid invoices.
//!
//! The e-commerce platform owns the stock numbers; this crate plans and
//! executes the per-line decrement against it, isolating each item's
//! failure (fail-soft) and aggregating the pass into a single outcome.

pub mod sync;

pub use sync::{StockApiError, StockGateway, SyncReport, aggregate_outcome, sync_invoice_lines};
