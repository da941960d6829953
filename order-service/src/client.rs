use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    AdjustManyRequest, AdjustManyResponse, AdjustmentRequest, AdjustmentResult, InventoryError,
    InventoryRecord, LookupRequest, LookupResponse, ReleaseResponse,
};
use std::time::Duration;

/// The order service's view of the inventory service.
///
/// Each call is delivered at most once by the transport; repeats are the
/// caller's decision. `adjust_many` is keyed so a repeated batch is replayed
/// by the inventory service rather than applied again.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn get_inventories(&self, product_ids: &[i64]) -> Result<Vec<InventoryRecord>, InventoryError>;

    async fn adjust_many(
        &self,
        idempotency_key: &str,
        adjustments: Vec<AdjustmentRequest>,
    ) -> Result<Vec<AdjustmentResult>, InventoryError>;

    async fn release(&self, idempotency_key: &str) -> Result<Vec<AdjustmentResult>, InventoryError>;
}

pub struct HttpInventoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpInventoryClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, R>(&self, path: &str, body: Option<&B>) -> Result<R, InventoryError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map_err(transport_error);
        }

        // Error bodies are the serialized InventoryError; anything else is
        // a proxy or crash page.
        match response.json::<InventoryError>().await {
            Ok(err) => Err(err),
            Err(_) => Err(InventoryError::internal(format!(
                "inventory service answered {status} on {path}"
            ))),
        }
    }
}

fn transport_error(err: reqwest::Error) -> InventoryError {
    if err.is_timeout() {
        InventoryError::timeout(err)
    } else {
        InventoryError::internal(err)
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn get_inventories(&self, product_ids: &[i64]) -> Result<Vec<InventoryRecord>, InventoryError> {
        let body = LookupRequest {
            product_ids: product_ids.to_vec(),
        };
        let response: LookupResponse = self.post("/inventory/lookup", Some(&body)).await?;
        Ok(response.inventories)
    }

    async fn adjust_many(
        &self,
        idempotency_key: &str,
        adjustments: Vec<AdjustmentRequest>,
    ) -> Result<Vec<AdjustmentResult>, InventoryError> {
        let body = AdjustManyRequest {
            idempotency_key: Some(idempotency_key.to_string()),
            adjustments,
        };
        let response: AdjustManyResponse = self.post("/inventory/adjust-many", Some(&body)).await?;
        Ok(response.results)
    }

    async fn release(&self, idempotency_key: &str) -> Result<Vec<AdjustmentResult>, InventoryError> {
        let path = format!("/inventory/reservations/{idempotency_key}/release");
        let response: ReleaseResponse = self.post::<(), _>(&path, None).await?;
        Ok(response.restored)
    }
}
