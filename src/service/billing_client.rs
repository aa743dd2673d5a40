use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::BillingConfig;
use crate::error::BillingError;
use crate::service::billing::{
    BillingPlatform, CounterpartyRecord, CreateCounterpartyRequest, CreateInvoiceRequest,
    CreatedInvoice,
};

/// 计费平台 REST 客户端
#[derive(Clone)]
pub struct HttpBillingPlatform {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CustomerSearchResponse {
    customers: Vec<CounterpartyRecord>,
}

impl HttpBillingPlatform {
    pub fn new(config: &BillingConfig) -> Result<Self, BillingError> {
        let client = Client::builder()
            .build()
            .map_err(|e| transport("client_init", e))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<Option<T>, BillingError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport(operation, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(operation, %status, "billing platform returned error: {}", body);
            return Err(BillingError::Rejected {
                operation: operation.to_string(),
                message: format!("{}: {}", status, body),
            });
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| transport(operation, e))
    }
}

fn transport(operation: &str, err: reqwest::Error) -> BillingError {
    BillingError::Transport {
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

fn missing(operation: &str) -> BillingError {
    BillingError::Rejected {
        operation: operation.to_string(),
        message: "resource not found".to_string(),
    }
}

#[async_trait]
impl BillingPlatform for HttpBillingPlatform {
    async fn get_customer(&self, external_id: &str) -> Result<CounterpartyRecord, BillingError> {
        let request = self
            .client
            .get(self.url(&format!("/customers/{}", external_id)));
        self.send("get_customer", request)
            .await?
            .ok_or_else(|| missing("get_customer"))
    }

    async fn find_customer(
        &self,
        name: &str,
        email: Option<&str>,
    ) -> Result<Option<CounterpartyRecord>, BillingError> {
        let mut query = vec![("name", name)];
        if let Some(email) = email {
            query.push(("email", email));
        }
        let request = self.client.get(self.url("/customers")).query(&query);
        let found: Option<CustomerSearchResponse> = self.send("find_customer", request).await?;
        Ok(found.and_then(|r| r.customers.into_iter().next()))
    }

    async fn create_customer(
        &self,
        request: CreateCounterpartyRequest,
    ) -> Result<CounterpartyRecord, BillingError> {
        let request = self.client.post(self.url("/customers")).json(&request);
        self.send("create_customer", request)
            .await?
            .ok_or_else(|| missing("create_customer"))
    }

    async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<CreatedInvoice, BillingError> {
        let request = self.client.post(self.url("/invoices")).json(&request);
        self.send("create_invoice", request)
            .await?
            .ok_or_else(|| missing("create_invoice"))
    }
}
