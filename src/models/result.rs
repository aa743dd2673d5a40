use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::models::{BillingStage, Job};

/// 阶段开票结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInvoice {
    pub stage: BillingStage,
    pub stage_fraction: BigDecimal,
    pub external_invoice_id: String,
    pub invoice_link: String,
    /// 本地 invoices 记录; 命中幂等短路时为 None
    pub local_invoice_id: Option<i64>,
    pub subtotal: Option<BigDecimal>,
    pub total: Option<BigDecimal>,
    /// 是否复用了已存在的发票 (未调用计费平台)
    pub reused: bool,
}

/// 工单解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum JobResolution {
    /// 报价单已关联工单, 仅补充发票链接
    Linked(Job),
    /// 合并进同地址的已有工单
    Merged(Job),
    Created(Job),
    /// job_auto_created 已置位但无关联工单: 不做任何事
    Skipped,
}

impl JobResolution {
    pub fn job(&self) -> Option<&Job> {
        match self {
            JobResolution::Linked(job) | JobResolution::Merged(job) | JobResolution::Created(job) => {
                Some(job)
            }
            JobResolution::Skipped => None,
        }
    }

    pub fn merged(&self) -> bool {
        matches!(self, JobResolution::Merged(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Settled,
    InvoicedJobPending,
    NotInvoiced,
}

/// 返回给调用方 (通知组件) 的结算结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    pub success: bool,
    pub outcome: SettlementOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SettlementResult {
    pub fn settled(invoice: &StageInvoice, resolution: &JobResolution) -> Self {
        let job = resolution.job();
        Self {
            success: true,
            outcome: SettlementOutcome::Settled,
            invoice_id: Some(invoice.external_invoice_id.clone()),
            invoice_link: Some(invoice.invoice_link.clone()),
            job_id: job.map(|j| j.id),
            job_number: job.map(|j| j.job_number.clone()),
            merged: Some(resolution.merged()),
            error: None,
        }
    }

    pub fn job_pending(invoice: &StageInvoice, error: String) -> Self {
        Self {
            success: false,
            outcome: SettlementOutcome::InvoicedJobPending,
            invoice_id: Some(invoice.external_invoice_id.clone()),
            invoice_link: Some(invoice.invoice_link.clone()),
            job_id: None,
            job_number: None,
            merged: None,
            error: Some(error),
        }
    }

    pub fn not_invoiced(error: String) -> Self {
        Self {
            success: false,
            outcome: SettlementOutcome::NotInvoiced,
            invoice_id: None,
            invoice_link: None,
            job_id: None,
            job_number: None,
            merged: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn result_json_uses_camel_case_and_omits_absent_fields() {
        let invoice = StageInvoice {
            stage: BillingStage::Deposit,
            stage_fraction: BigDecimal::from_str("0.5").unwrap(),
            external_invoice_id: "inv_1".to_string(),
            invoice_link: "https://billing.example.com/i/inv_1".to_string(),
            local_invoice_id: Some(1),
            subtotal: None,
            total: None,
            reused: false,
        };
        let value =
            serde_json::to_value(SettlementResult::job_pending(&invoice, "db down".to_string()))
                .unwrap();

        assert_eq!(value["outcome"], "invoiced_job_pending");
        assert_eq!(value["invoiceId"], "inv_1");
        assert_eq!(value["invoiceLink"], "https://billing.example.com/i/inv_1");
        assert!(value.get("jobId").is_none());
        assert!(value.get("merged").is_none());
    }
}
