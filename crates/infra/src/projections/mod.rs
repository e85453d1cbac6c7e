//! Projection implementations (read model builders).
//!
//! Projections consume domain events off the bus and build query-optimized
//! read models. They are rebuildable from the stream and idempotent under
//! at-least-once delivery (sequence-number cursors drop duplicates).

pub mod invoices;
pub mod staff;

pub use invoices::{InvoiceReadModel, InvoicesProjection, ProjectionError};
pub use staff::{StaffDirectoryProjection, StaffReadModel};
