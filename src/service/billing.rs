//! 计费平台交易对手 (counterparty) 解析
//!
//! 计费平台是地址与电话的权威来源 (它决定税务辖区), 因此解析过程会把
//! 平台上的规范值单向同步回本地客户记录.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BillingError;
use crate::models::{BillingStage, Customer, StageLineItem, TaxBreakdown};
use crate::service::address::normalize;

/// 平台上的客户记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterpartyRecord {
    pub external_id: String,
    pub canonical_address: Option<String>,
    pub canonical_phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCounterpartyRequest {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    pub customer_external_id: String,
    pub reference_number: String,
    pub stage: BillingStage,
    pub items: Vec<StageLineItem>,
    pub tax: TaxBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub external_invoice_id: String,
    pub customer_facing_url: String,
}

/// 外部计费平台能力
#[async_trait]
pub trait BillingPlatform: Send + Sync {
    async fn get_customer(&self, external_id: &str) -> Result<CounterpartyRecord, BillingError>;

    /// 按名称/邮箱查找
    async fn find_customer(
        &self,
        name: &str,
        email: Option<&str>,
    ) -> Result<Option<CounterpartyRecord>, BillingError>;

    async fn create_customer(
        &self,
        request: CreateCounterpartyRequest,
    ) -> Result<CounterpartyRecord, BillingError>;

    async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<CreatedInvoice, BillingError>;
}

/// 给外部调用加超时, 超时与其他失败同等对待
pub async fn with_timeout<T, F>(
    timeout: Duration,
    operation: &str,
    fut: F,
) -> Result<T, BillingError>
where
    F: Future<Output = Result<T, BillingError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!("✗ billing platform {} timed out after {:?}", operation, timeout);
            Err(BillingError::Timeout {
                operation: operation.to_string(),
            })
        }
    }
}

/// 解析结果: 同步后的客户以及本地记录是否被修改
#[derive(Debug, Clone, PartialEq)]
pub struct CounterpartyResolution {
    pub customer: Customer,
    pub changed: bool,
}

pub struct CounterpartyResolver {
    platform: Arc<dyn BillingPlatform>,
    timeout: Duration,
}

impl CounterpartyResolver {
    pub fn new(platform: Arc<dyn BillingPlatform>, timeout: Duration) -> Self {
        Self { platform, timeout }
    }

    /// 查找或创建平台客户, 并把平台的规范地址/电话同步到返回的客户上
    pub async fn resolve_or_create(
        &self,
        customer: &Customer,
    ) -> Result<CounterpartyResolution, BillingError> {
        let record = match customer.billing_external_id.as_deref() {
            Some(external_id) => {
                with_timeout(
                    self.timeout,
                    "get_customer",
                    self.platform.get_customer(external_id),
                )
                .await?
            }
            None => {
                let found = with_timeout(
                    self.timeout,
                    "find_customer",
                    self.platform
                        .find_customer(&customer.name, customer.email.as_deref()),
                )
                .await?;
                match found {
                    Some(record) => {
                        tracing::info!(
                            customer_id = customer.id,
                            external_id = %record.external_id,
                            "Adopting existing billing counterparty"
                        );
                        record
                    }
                    None => {
                        let record = with_timeout(
                            self.timeout,
                            "create_customer",
                            self.platform.create_customer(CreateCounterpartyRequest {
                                name: customer.name.clone(),
                                email: customer.email.clone(),
                                phone: customer.phone.clone(),
                                address: customer.address.clone(),
                            }),
                        )
                        .await?;
                        tracing::info!(
                            customer_id = customer.id,
                            external_id = %record.external_id,
                            "Created billing counterparty"
                        );
                        record
                    }
                }
            }
        };

        Ok(sync_customer(customer, &record))
    }
}

/// 把平台记录同步到本地客户, 仅在有实质差异时覆盖
pub fn sync_customer(customer: &Customer, record: &CounterpartyRecord) -> CounterpartyResolution {
    let mut synced = customer.clone();
    let mut changed = false;

    if synced.billing_external_id.as_deref() != Some(record.external_id.as_str()) {
        synced.billing_external_id = Some(record.external_id.clone());
        changed = true;
    }

    if let Some(address) = record.canonical_address.as_deref().map(str::trim) {
        if !address.is_empty() && addresses_differ(synced.address.as_deref(), address) {
            tracing::info!(
                customer_id = customer.id,
                "Customer address replaced by billing platform value"
            );
            synced.address = Some(address.to_string());
            changed = true;
        }
    }

    if let Some(phone) = record.canonical_phone.as_deref().map(str::trim) {
        if !phone.is_empty() && phones_differ(synced.phone.as_deref(), phone) {
            synced.phone = Some(phone.to_string());
            changed = true;
        }
    }

    CounterpartyResolution {
        customer: synced,
        changed,
    }
}

fn addresses_differ(local: Option<&str>, platform: &str) -> bool {
    match local {
        Some(local) => normalize(local) != normalize(platform),
        None => true,
    }
}

fn phone_digits(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    // 去掉北美国家码
    match digits.strip_prefix('1') {
        Some(rest) if rest.len() == 10 => rest.to_string(),
        _ => digits,
    }
}

fn phones_differ(local: Option<&str>, platform: &str) -> bool {
    match local {
        Some(local) => phone_digits(local) != phone_digits(platform),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customer, MockBillingPlatform};

    fn resolver(platform: Arc<MockBillingPlatform>) -> CounterpartyResolver {
        CounterpartyResolver::new(platform, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn creates_counterparty_when_not_found() {
        let platform = Arc::new(MockBillingPlatform::new());
        let local = customer(1, Some("123 Main St, Springfield, IL 62704"));

        let resolution = resolver(platform.clone()).resolve_or_create(&local).await.unwrap();

        assert!(resolution.changed);
        assert!(resolution.customer.billing_external_id.is_some());
        assert_eq!(platform.customer_creations(), 1);
    }

    #[tokio::test]
    async fn adopts_existing_counterparty_found_by_email() {
        let platform = Arc::new(MockBillingPlatform::new());
        platform.seed_customer(
            "Pat Doe",
            Some("pat@example.com"),
            CounterpartyRecord {
                external_id: "cus_existing".to_string(),
                canonical_address: None,
                canonical_phone: None,
            },
        );
        let local = customer(1, Some("123 Main St, Springfield, IL 62704"));

        let resolution = resolver(platform.clone()).resolve_or_create(&local).await.unwrap();

        assert_eq!(
            resolution.customer.billing_external_id.as_deref(),
            Some("cus_existing")
        );
        assert_eq!(platform.customer_creations(), 0);
    }

    #[tokio::test]
    async fn linked_customer_syncs_platform_address_and_phone() {
        let platform = Arc::new(MockBillingPlatform::new());
        platform.seed_customer(
            "Pat Doe",
            None,
            CounterpartyRecord {
                external_id: "cus_7".to_string(),
                canonical_address: Some("456 Oak Avenue, Springfield, IL 62704".to_string()),
                canonical_phone: Some("+1 (217) 555-0100".to_string()),
            },
        );
        let mut local = customer(1, Some("123 Main St, Springfield, IL 62704"));
        local.billing_external_id = Some("cus_7".to_string());
        local.phone = Some("217-555-0100".to_string());

        let resolution = resolver(platform).resolve_or_create(&local).await.unwrap();

        assert!(resolution.changed);
        assert_eq!(
            resolution.customer.address.as_deref(),
            Some("456 Oak Avenue, Springfield, IL 62704")
        );
        // 仅格式不同的电话不算变更
        assert_eq!(resolution.customer.phone.as_deref(), Some("217-555-0100"));
    }

    #[test]
    fn trivial_address_differences_are_not_changes() {
        let mut local = customer(1, Some("123 Main Street, Springfield, IL 62704"));
        local.billing_external_id = Some("cus_1".to_string());
        let record = CounterpartyRecord {
            external_id: "cus_1".to_string(),
            canonical_address: Some("123 MAIN ST, SPRINGFIELD, IL 62704".to_string()),
            canonical_phone: None,
        };

        let resolution = sync_customer(&local, &record);
        assert!(!resolution.changed);
        assert_eq!(resolution.customer, local);
    }

    #[tokio::test]
    async fn platform_failure_is_propagated() {
        let platform = Arc::new(MockBillingPlatform::new());
        platform.fail_customer_calls(true);
        let local = customer(1, Some("123 Main St, Springfield, IL 62704"));

        let err = resolver(platform).resolve_or_create(&local).await.unwrap_err();
        assert!(matches!(err, BillingError::Transport { .. }));
    }

    #[tokio::test]
    async fn slow_platform_times_out() {
        let platform = Arc::new(MockBillingPlatform::new());
        platform.set_latency(Duration::from_millis(200));
        let local = customer(1, Some("123 Main St, Springfield, IL 62704"));

        let err = CounterpartyResolver::new(platform, Duration::from_millis(20))
            .resolve_or_create(&local)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Timeout { .. }));
    }
}
