use async_trait::async_trait;
use thiserror::Error;

use billflow_billing::{InvoiceLine, StockLineResult, StockUpdateStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockApiError {
    /// The stock platform credential is absent or unusable.
    #[error("stock platform is not configured: {0}")]
    Configuration(String),

    #[error("stock platform request failed: {0}")]
    Request(String),

    #[error("unexpected stock platform response: {0}")]
    Response(String),

    #[error("product not found on the stock platform: {0}")]
    UnknownProduct(String),
}

/// Remote stock access. `fetch_level` returns `None` for products the
/// platform tracks as unlimited.
#[async_trait]
pub trait StockGateway: Send + Sync {
    async fn fetch_level(&self, product_ref: &str) -> Result<Option<i64>, StockApiError>;

    async fn push_level(&self, product_ref: &str, new_level: i64) -> Result<(), StockApiError>;
}

/// The result of one sync pass over an invoice's line items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub outcome: StockUpdateStatus,
    pub items: Vec<StockLineResult>,
    /// Number of items whose remote level actually changed.
    pub updated_items: usize,
}

/// Decrement remote stock for every line item carrying a product reference.
///
/// Free-text lines are skipped (not failed). Each item is attempted
/// independently: one failure never aborts the rest of the pass. Remote
/// levels clamp at zero — overselling never drives stock negative.
pub async fn sync_invoice_lines(
    gateway: &dyn StockGateway,
    lines: &[InvoiceLine],
) -> SyncReport {
    let mut items = Vec::new();
    let mut updated = 0usize;

    for line in lines {
        let Some(product_ref) = line.product_ref.as_deref() else {
            continue;
        };

        match sync_one(gateway, product_ref, line.quantity).await {
            Ok(changed) => {
                if changed {
                    updated += 1;
                }
                items.push(StockLineResult {
                    product_ref: product_ref.to_string(),
                    quantity: line.quantity,
                    success: true,
                    error: None,
                });
            }
            Err(err) => {
                tracing::warn!(product_ref, error = %err, "stock decrement failed");
                items.push(StockLineResult {
                    product_ref: product_ref.to_string(),
                    quantity: line.quantity,
                    success: false,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    SyncReport {
        outcome: aggregate_outcome(&items),
        items,
        updated_items: updated,
    }
}

/// Returns whether the remote level changed.
async fn sync_one(
    gateway: &dyn StockGateway,
    product_ref: &str,
    quantity_sold: i64,
) -> Result<bool, StockApiError> {
    let Some(current) = gateway.fetch_level(product_ref).await? else {
        // Unlimited stock: nothing to decrement.
        return Ok(false);
    };

    let new_level = (current - quantity_sold).max(0);
    gateway.push_level(product_ref, new_level).await?;
    Ok(true)
}

/// Aggregate per-item results into the invoice-level status.
///
/// All attempted succeeded (or nothing was attempted) → completed; none
/// succeeded with at least one attempted → failed; otherwise partial.
pub fn aggregate_outcome(items: &[StockLineResult]) -> StockUpdateStatus {
    if items.is_empty() {
        return StockUpdateStatus::Completed;
    }
    let successes = items.iter().filter(|i| i.success).count();
    if successes == items.len() {
        StockUpdateStatus::Completed
    } else if successes == 0 {
        StockUpdateStatus::Failed
    } else {
        StockUpdateStatus::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fake remote platform: `None` level models unlimited stock, refs in
    /// `failing` error on push.
    struct FakePlatform {
        levels: Mutex<HashMap<String, Option<i64>>>,
        failing: Vec<String>,
    }

    impl FakePlatform {
        fn new(levels: &[(&str, Option<i64>)]) -> Self {
            Self {
                levels: Mutex::new(
                    levels
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                ),
                failing: Vec::new(),
            }
        }

        fn failing(mut self, refs: &[&str]) -> Self {
            self.failing = refs.iter().map(|r| r.to_string()).collect();
            self
        }

        fn level(&self, product_ref: &str) -> Option<i64> {
            self.levels.lock().unwrap().get(product_ref).copied().flatten()
        }
    }

    #[async_trait]
    impl StockGateway for FakePlatform {
        async fn fetch_level(&self, product_ref: &str) -> Result<Option<i64>, StockApiError> {
            self.levels
                .lock()
                .unwrap()
                .get(product_ref)
                .copied()
                .ok_or_else(|| StockApiError::UnknownProduct(product_ref.to_string()))
        }

        async fn push_level(&self, product_ref: &str, new_level: i64) -> Result<(), StockApiError> {
            if self.failing.iter().any(|r| r == product_ref) {
                return Err(StockApiError::Request("remote timeout".to_string()));
            }
            self.levels
                .lock()
                .unwrap()
                .insert(product_ref.to_string(), Some(new_level));
            Ok(())
        }
    }

    fn line(no: u32, product_ref: Option<&str>, quantity: i64) -> InvoiceLine {
        InvoiceLine {
            line_no: no,
            product_ref: product_ref.map(|r| r.to_string()),
            description: format!("item {no}"),
            quantity,
            unit_price: 100,
        }
    }

    #[tokio::test]
    async fn decrements_each_referenced_item() {
        let platform = FakePlatform::new(&[("prod_a", Some(10)), ("prod_b", Some(3))]);
        let lines = vec![line(1, Some("prod_a"), 2), line(2, Some("prod_b"), 1)];

        let report = sync_invoice_lines(&platform, &lines).await;

        assert_eq!(report.outcome, StockUpdateStatus::Completed);
        assert_eq!(report.updated_items, 2);
        assert_eq!(platform.level("prod_a"), Some(8));
        assert_eq!(platform.level("prod_b"), Some(2));
    }

    #[tokio::test]
    async fn clamps_remote_stock_at_zero() {
        let platform = FakePlatform::new(&[("prod_a", Some(1))]);
        let lines = vec![line(1, Some("prod_a"), 5)];

        let report = sync_invoice_lines(&platform, &lines).await;

        assert_eq!(report.outcome, StockUpdateStatus::Completed);
        assert_eq!(platform.level("prod_a"), Some(0));
    }

    #[tokio::test]
    async fn unlimited_stock_is_a_noop_success() {
        let platform = FakePlatform::new(&[("prod_a", None)]);
        let lines = vec![line(1, Some("prod_a"), 3)];

        let report = sync_invoice_lines(&platform, &lines).await;

        assert_eq!(report.outcome, StockUpdateStatus::Completed);
        assert_eq!(report.updated_items, 0);
        assert!(report.items[0].success);
    }

    #[tokio::test]
    async fn free_text_lines_are_skipped_not_failed() {
        let platform = FakePlatform::new(&[("prod_a", Some(5))]);
        let lines = vec![line(1, None, 2), line(2, Some("prod_a"), 1)];

        let report = sync_invoice_lines(&platform, &lines).await;

        assert_eq!(report.items.len(), 1);
        assert_eq!(report.outcome, StockUpdateStatus::Completed);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_rest() {
        let platform =
            FakePlatform::new(&[("prod_a", Some(5)), ("prod_b", Some(5))]).failing(&["prod_a"]);
        let lines = vec![line(1, Some("prod_a"), 1), line(2, Some("prod_b"), 2)];

        let report = sync_invoice_lines(&platform, &lines).await;

        assert_eq!(report.outcome, StockUpdateStatus::Partial);
        assert_eq!(report.updated_items, 1);
        assert!(!report.items[0].success);
        assert!(report.items[0].error.is_some());
        assert!(report.items[1].success);
        assert_eq!(platform.level("prod_b"), Some(3));
    }

    #[tokio::test]
    async fn all_failures_aggregate_to_failed() {
        let platform = FakePlatform::new(&[]);
        let lines = vec![line(1, Some("ghost_1"), 1), line(2, Some("ghost_2"), 1)];

        let report = sync_invoice_lines(&platform, &lines).await;

        assert_eq!(report.outcome, StockUpdateStatus::Failed);
        assert_eq!(report.updated_items, 0);
    }
}
