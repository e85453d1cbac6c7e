//! Remote stock platform clients implementing [`StockGateway`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use billflow_stock::{StockApiError, StockGateway};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the e-commerce platform's stock API.
///
/// `GET /products/{ref}/stock` returns `{"stock": <number|null>}` (null =
/// unlimited); `PUT` with the same shape sets the level.
pub struct HttpStockGateway {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HttpStockGateway {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, StockApiError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(StockApiError::Configuration(
                "stock API key is empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StockApiError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn stock_url(&self, product_ref: &str) -> String {
        format!("{}/products/{product_ref}/stock", self.api_base)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StockBody {
    stock: Option<i64>,
}

#[async_trait]
impl StockGateway for HttpStockGateway {
    async fn fetch_level(&self, product_ref: &str) -> Result<Option<i64>, StockApiError> {
        let response = self
            .http
            .get(self.stock_url(product_ref))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| StockApiError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StockApiError::UnknownProduct(product_ref.to_string()));
        }
        if !response.status().is_success() {
            return Err(StockApiError::Response(format!(
                "stock fetch returned {}",
                response.status()
            )));
        }

        let body: StockBody = response
            .json()
            .await
            .map_err(|e| StockApiError::Response(e.to_string()))?;
        Ok(body.stock)
    }

    async fn push_level(&self, product_ref: &str, new_level: i64) -> Result<(), StockApiError> {
        let response = self
            .http
            .put(self.stock_url(product_ref))
            .bearer_auth(&self.api_key)
            .json(&StockBody {
                stock: Some(new_level),
            })
            .send()
            .await
            .map_err(|e| StockApiError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StockApiError::UnknownProduct(product_ref.to_string()));
        }
        if !response.status().is_success() {
            return Err(StockApiError::Response(format!(
                "stock update returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-memory stock platform (dev/test wiring).
#[derive(Debug, Default)]
pub struct InMemoryStockGateway {
    levels: Mutex<HashMap<String, Option<i64>>>,
}

impl InMemoryStockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a product's remote level (`None` = unlimited).
    pub fn set_level(&self, product_ref: impl Into<String>, level: Option<i64>) {
        self.levels.lock().unwrap().insert(product_ref.into(), level);
    }

    pub fn level(&self, product_ref: &str) -> Option<Option<i64>> {
        self.levels.lock().unwrap().get(product_ref).copied()
    }
}

#[async_trait]
impl StockGateway for InMemoryStockGateway {
    async fn fetch_level(&self, product_ref: &str) -> Result<Option<i64>, StockApiError> {
        self.levels
            .lock()
            .unwrap()
            .get(product_ref)
            .copied()
            .ok_or_else(|| StockApiError::UnknownProduct(product_ref.to_string()))
    }

    async fn push_level(&self, product_ref: &str, new_level: i64) -> Result<(), StockApiError> {
        self.levels
            .lock()
            .unwrap()
            .insert(product_ref.to_string(), Some(new_level));
        Ok(())
    }
}
