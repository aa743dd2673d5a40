use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use crate::db::queries;
use crate::error::StoreError;
use crate::models::{
    BillingStage, Customer, Invoice, Job, NewInvoice, NewJob, Proposal, ProposalLineItem, Tier,
};

/// 结算流水线使用的持久化能力
///
/// 事务边界: `record_stage_invoice`, `create_job_for_proposal`,
/// `merge_job_for_proposal` 各自原子提交.
///
/// 工单写入使用 `Job::version` 做乐观锁: 版本不一致时返回 `Ok(false)`,
/// 由调用方重新读取后重试.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn get_proposal(&self, proposal_id: i64) -> Result<Option<Proposal>, StoreError>;

    async fn list_proposal_items(
        &self,
        proposal_id: i64,
    ) -> Result<Vec<ProposalLineItem>, StoreError>;

    async fn list_tiers(&self, proposal_id: i64) -> Result<Vec<Tier>, StoreError>;

    async fn get_customer(&self, customer_id: i64) -> Result<Option<Customer>, StoreError>;

    async fn save_customer_billing(&self, customer: &Customer) -> Result<(), StoreError>;

    /// 调用计费平台前认领阶段; false 表示已开票或另一请求持有未过期的认领
    async fn claim_stage(
        &self,
        proposal_id: i64,
        stage: BillingStage,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    async fn record_stage_invoice(
        &self,
        invoice: &NewInvoice,
        stage: BillingStage,
        invoice_link: &str,
    ) -> Result<Invoice, StoreError>;

    async fn record_stage_failed(
        &self,
        proposal_id: i64,
        stage: BillingStage,
        note: &str,
    ) -> Result<(), StoreError>;

    async fn list_open_jobs(&self, customer_id: i64) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError>;

    async fn latest_job_number(&self, prefix: &str) -> Result<Option<String>, StoreError>;

    async fn create_job_for_proposal(
        &self,
        job: &NewJob,
        proposal_id: i64,
    ) -> Result<Job, StoreError>;

    async fn merge_job_for_proposal(
        &self,
        job: &Job,
        proposal_id: i64,
    ) -> Result<bool, StoreError>;

    async fn update_job(&self, job: &Job) -> Result<bool, StoreError>;
}

/// PostgreSQL 实现
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn get_proposal(&self, proposal_id: i64) -> Result<Option<Proposal>, StoreError> {
        queries::get_proposal(&self.pool, proposal_id).await
    }

    async fn list_proposal_items(
        &self,
        proposal_id: i64,
    ) -> Result<Vec<ProposalLineItem>, StoreError> {
        queries::list_proposal_items(&self.pool, proposal_id).await
    }

    async fn list_tiers(&self, proposal_id: i64) -> Result<Vec<Tier>, StoreError> {
        queries::list_tiers(&self.pool, proposal_id).await
    }

    async fn get_customer(&self, customer_id: i64) -> Result<Option<Customer>, StoreError> {
        queries::get_customer(&self.pool, customer_id).await
    }

    async fn save_customer_billing(&self, customer: &Customer) -> Result<(), StoreError> {
        queries::save_customer_billing(&self.pool, customer).await
    }

    async fn claim_stage(
        &self,
        proposal_id: i64,
        stage: BillingStage,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        queries::claim_stage(&self.pool, proposal_id, stage, lease).await
    }

    async fn record_stage_invoice(
        &self,
        invoice: &NewInvoice,
        stage: BillingStage,
        invoice_link: &str,
    ) -> Result<Invoice, StoreError> {
        queries::record_stage_invoice(&self.pool, invoice, stage, invoice_link).await
    }

    async fn record_stage_failed(
        &self,
        proposal_id: i64,
        stage: BillingStage,
        note: &str,
    ) -> Result<(), StoreError> {
        queries::record_stage_failed(&self.pool, proposal_id, stage, note).await
    }

    async fn list_open_jobs(&self, customer_id: i64) -> Result<Vec<Job>, StoreError> {
        queries::list_open_jobs(&self.pool, customer_id).await
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        queries::get_job(&self.pool, job_id).await
    }

    async fn latest_job_number(&self, prefix: &str) -> Result<Option<String>, StoreError> {
        queries::latest_job_number(&self.pool, prefix).await
    }

    async fn create_job_for_proposal(
        &self,
        job: &NewJob,
        proposal_id: i64,
    ) -> Result<Job, StoreError> {
        queries::create_job_for_proposal(&self.pool, job, proposal_id).await
    }

    async fn merge_job_for_proposal(
        &self,
        job: &Job,
        proposal_id: i64,
    ) -> Result<bool, StoreError> {
        queries::merge_job_for_proposal(&self.pool, job, proposal_id).await
    }

    async fn update_job(&self, job: &Job) -> Result<bool, StoreError> {
        queries::update_job(&self.pool, job).await
    }
}
