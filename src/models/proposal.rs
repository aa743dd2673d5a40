use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// 报价单的档位模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    Single,
    Multi,
}

impl FromStr for TierMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(TierMode::Single),
            "multi" => Ok(TierMode::Multi),
            other => Err(format!("unknown tier mode '{}'", other)),
        }
    }
}

/// 计费阶段 (定金 / 粗装 / 尾款)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStage {
    Deposit,
    RoughIn,
    Final,
}

impl BillingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStage::Deposit => "deposit",
            BillingStage::RoughIn => "rough_in",
            BillingStage::Final => "final",
        }
    }

    /// 发票参考号中的阶段代码
    pub fn code(&self) -> &'static str {
        match self {
            BillingStage::Deposit => "DEP",
            BillingStage::RoughIn => "RGH",
            BillingStage::Final => "FIN",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BillingStage::Deposit => "Deposit",
            BillingStage::RoughIn => "Rough-In",
            BillingStage::Final => "Final",
        }
    }
}

impl fmt::Display for BillingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deposit" => Ok(BillingStage::Deposit),
            "rough_in" | "rough-in" | "roughin" => Ok(BillingStage::RoughIn),
            "final" => Ok(BillingStage::Final),
            other => Err(format!("unknown billing stage '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// 已认领, 正在调用计费平台
    Pending,
    Sent,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Sent => "SENT",
            StageStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StageStatus::Pending),
            "SENT" => Ok(StageStatus::Sent),
            "FAILED" => Ok(StageStatus::Failed),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}

/// 单个阶段的开票状态 (status 为 None 表示未开票)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageBilling {
    pub invoice_id: Option<String>,
    pub invoice_link: Option<String>,
    pub status: Option<StageStatus>,
    pub note: Option<String>,
}

/// 报价单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: i64,
    pub number: i64,
    pub customer_id: i64,
    pub title: String,
    pub tier_mode: TierMode,
    pub subtotal: BigDecimal,
    pub total: BigDecimal,
    pub tax_rate: BigDecimal,
    pub selected_tier_id: Option<i64>,
    pub deposit: StageBilling,
    pub rough_in: StageBilling,
    pub final_stage: StageBilling,
    pub job_id: Option<i64>,
    pub job_auto_created: bool,
}

impl Proposal {
    pub fn billing(&self, stage: BillingStage) -> &StageBilling {
        match stage {
            BillingStage::Deposit => &self.deposit,
            BillingStage::RoughIn => &self.rough_in,
            BillingStage::Final => &self.final_stage,
        }
    }

    pub fn billing_mut(&mut self, stage: BillingStage) -> &mut StageBilling {
        match stage {
            BillingStage::Deposit => &mut self.deposit,
            BillingStage::RoughIn => &mut self.rough_in,
            BillingStage::Final => &mut self.final_stage,
        }
    }

    /// 确定性的发票参考号, 例如 P1042-DEP
    pub fn reference_number(&self, stage: BillingStage) -> String {
        format!("P{}-{}", self.number, stage.code())
    }
}

/// proposals 表行
#[derive(Debug, Clone, FromRow)]
pub struct ProposalRow {
    pub id: i64,
    pub number: i64,
    pub customer_id: i64,
    pub title: String,
    pub tier_mode: String,
    pub subtotal: BigDecimal,
    pub total: BigDecimal,
    pub tax_rate: BigDecimal,
    pub selected_tier_id: Option<i64>,
    pub deposit_invoice_id: Option<String>,
    pub deposit_invoice_link: Option<String>,
    pub deposit_status: Option<String>,
    pub deposit_note: Option<String>,
    pub rough_in_invoice_id: Option<String>,
    pub rough_in_invoice_link: Option<String>,
    pub rough_in_status: Option<String>,
    pub rough_in_note: Option<String>,
    pub final_invoice_id: Option<String>,
    pub final_invoice_link: Option<String>,
    pub final_status: Option<String>,
    pub final_note: Option<String>,
    pub job_id: Option<i64>,
    pub job_auto_created: bool,
}

fn stage_billing(
    invoice_id: Option<String>,
    invoice_link: Option<String>,
    status: Option<String>,
    note: Option<String>,
) -> Result<StageBilling, StoreError> {
    let status = status
        .map(|s| s.parse::<StageStatus>())
        .transpose()
        .map_err(StoreError::Corrupt)?;
    Ok(StageBilling {
        invoice_id,
        invoice_link,
        status,
        note,
    })
}

impl TryFrom<ProposalRow> for Proposal {
    type Error = StoreError;

    fn try_from(row: ProposalRow) -> Result<Self, Self::Error> {
        Ok(Proposal {
            id: row.id,
            number: row.number,
            customer_id: row.customer_id,
            title: row.title,
            tier_mode: row.tier_mode.parse().map_err(StoreError::Corrupt)?,
            subtotal: row.subtotal,
            total: row.total,
            tax_rate: row.tax_rate,
            selected_tier_id: row.selected_tier_id,
            deposit: stage_billing(
                row.deposit_invoice_id,
                row.deposit_invoice_link,
                row.deposit_status,
                row.deposit_note,
            )?,
            rough_in: stage_billing(
                row.rough_in_invoice_id,
                row.rough_in_invoice_link,
                row.rough_in_status,
                row.rough_in_note,
            )?,
            final_stage: stage_billing(
                row.final_invoice_id,
                row.final_invoice_link,
                row.final_status,
                row.final_note,
            )?,
            job_id: row.job_id,
            job_auto_created: row.job_auto_created,
        })
    }
}

/// 报价明细 (只读快照)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ProposalLineItem {
    pub id: i64,
    pub proposal_id: i64,
    pub tier_id: Option<i64>,
    pub description: String,
    pub unit_price: BigDecimal,
    pub quantity: BigDecimal,
    pub total: BigDecimal,
    pub is_addon: bool,
    pub is_selected: bool,
}

impl ProposalLineItem {
    /// 非附加项总是计入; 附加项仅在客户勾选时计入
    pub fn is_included(&self) -> bool {
        !self.is_addon || self.is_selected
    }
}

/// 多档位报价中的一个档位
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Tier {
    pub id: i64,
    pub proposal_id: i64,
    pub level: i16,
    pub name: String,
    pub is_selected: bool,
}
