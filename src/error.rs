use thiserror::Error;

use crate::models::BillingStage;

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {}", constraint.as_deref().unwrap_or("unknown"))]
    UniqueViolation { constraint: Option<String> },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // 23505 = unique_violation
            if db.code().as_deref() == Some("23505") {
                return StoreError::UniqueViolation {
                    constraint: db.constraint().map(str::to_owned),
                };
            }
        }
        StoreError::Database(err)
    }
}

/// 外部计费平台错误
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing platform rejected {operation}: {message}")]
    Rejected { operation: String, message: String },

    #[error("billing platform unreachable during {operation}: {message}")]
    Transport { operation: String, message: String },

    #[error("billing platform timed out during {operation}")]
    Timeout { operation: String },
}

#[derive(Debug, Error)]
pub enum TaxError {
    #[error("cannot determine tax jurisdiction for address: {0}")]
    Unresolvable(String),
}

/// 结算流水线错误分类
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("customer {customer_id} has no service address; tax jurisdiction cannot be determined")]
    MissingAddress { customer_id: i64 },

    #[error("proposal {0} not found")]
    ProposalNotFound(i64),

    #[error("customer {0} not found")]
    CustomerNotFound(i64),

    #[error("proposal {proposal_id} is multi-tier but has no selected tier")]
    NoSelectedTier { proposal_id: i64 },

    #[error("counterparty resolution failed: {0}")]
    Counterparty(#[source] BillingError),

    #[error("tax resolution failed: {0}")]
    Tax(#[from] TaxError),

    #[error("invoice creation failed: {0}")]
    InvoiceCreation(#[source] BillingError),

    #[error("{stage} invoice for proposal {proposal_id} is already being created by another request")]
    StageInFlight {
        proposal_id: i64,
        stage: BillingStage,
    },

    #[error("job number generation exhausted after {attempts} attempts")]
    JobNumberExhausted { attempts: u32 },

    #[error("job {job_id} kept changing concurrently; gave up after {attempts} attempts")]
    JobUpdateConflict { job_id: i64, attempts: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SettlementError {
    /// 前置条件类错误: 未触达任何外部系统
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SettlementError::MissingAddress { .. }
                | SettlementError::ProposalNotFound(_)
                | SettlementError::CustomerNotFound(_)
                | SettlementError::NoSelectedTier { .. }
        )
    }

    /// 与并发请求冲突, 调用方稍后重试即可
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SettlementError::StageInFlight { .. } | SettlementError::JobUpdateConflict { .. }
        )
    }
}

pub type Result<T, E = SettlementError> = std::result::Result<T, E>;
