use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::StoreError;
use crate::models::BillingStage;

/// 工单生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotScheduled,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Archived,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotScheduled => "not_scheduled",
            JobStatus::Scheduled => "scheduled",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Archived => "archived",
        }
    }

    /// 已取消/已归档的工单不参与合并
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Archived)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_scheduled" => Ok(JobStatus::NotScheduled),
            "scheduled" => Ok(JobStatus::Scheduled),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "archived" => Ok(JobStatus::Archived),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// 工单上的发票链接记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLink {
    pub url: String,
    pub stage: BillingStage,
    pub stage_fraction: BigDecimal,
    pub invoice_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// 工单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_number: String,
    pub customer_id: i64,
    pub title: String,
    pub address: String,
    pub status: JobStatus,
    pub notes: String,
    pub proposal_links: IndexSet<String>,
    pub invoice_links: Vec<InvoiceLink>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// 乐观锁版本, 每次保存加一
    pub version: i64,
}

impl Job {
    pub fn has_invoice_link(&self, url: &str) -> bool {
        self.invoice_links.iter().any(|l| l.url == url)
    }

    /// 追加发票链接, 按 URL 去重; 返回是否实际追加
    pub fn attach_invoice_link(&mut self, link: InvoiceLink) -> bool {
        if self.has_invoice_link(&link.url) {
            return false;
        }
        self.invoice_links.push(link);
        true
    }

    pub fn append_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }
}

/// 待插入的工单
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_number: String,
    pub customer_id: i64,
    pub title: String,
    pub address: String,
    pub notes: String,
    pub proposal_links: IndexSet<String>,
    pub invoice_links: Vec<InvoiceLink>,
    pub created_by: String,
}

/// jobs 表行
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub job_number: String,
    pub customer_id: i64,
    pub title: String,
    pub address: String,
    pub status: String,
    pub notes: String,
    pub proposal_links: Json<Vec<String>>,
    pub invoice_links: Json<Vec<InvoiceLink>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            job_number: row.job_number,
            customer_id: row.customer_id,
            title: row.title,
            address: row.address,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            notes: row.notes,
            proposal_links: row.proposal_links.0.into_iter().collect(),
            invoice_links: row.invoice_links.0,
            created_by: row.created_by,
            created_at: row.created_at,
            version: row.version,
        })
    }
}
