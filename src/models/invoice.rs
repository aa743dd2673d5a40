use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 本地发票记录 (镜像计费平台上已创建的发票, 创建后不再更新)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub customer_id: i64,
    pub proposal_id: i64,
    pub stage: String,
    pub subtotal: BigDecimal,
    pub state_tax_amount: BigDecimal,
    pub county_tax_amount: BigDecimal,
    pub county: String,
    pub total: BigDecimal,
    pub external_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoice {
    pub customer_id: i64,
    pub proposal_id: i64,
    pub stage: String,
    pub subtotal: BigDecimal,
    pub state_tax_amount: BigDecimal,
    pub county_tax_amount: BigDecimal,
    pub county: String,
    pub total: BigDecimal,
    pub external_id: String,
    pub status: String,
}

/// 阶段开票明细行 (数量/金额已乘以阶段比例)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLineItem {
    pub source_item_id: i64,
    pub description: String,
    pub unit_price: BigDecimal,
    pub quantity: BigDecimal,
    pub total: BigDecimal,
}

/// 税额拆分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub state_tax_rate: BigDecimal,
    pub county_tax_rate: BigDecimal,
    pub state_tax_amount: BigDecimal,
    pub county_tax_amount: BigDecimal,
    pub county: String,
    pub total_tax_amount: BigDecimal,
    pub total: BigDecimal,
}

impl TaxBreakdown {
    pub fn combined_rate(&self) -> BigDecimal {
        &self.state_tax_rate + &self.county_tax_rate
    }
}
