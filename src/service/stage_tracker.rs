use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
use crate::error::StoreError;
use crate::models::JobStatus;

/// 工单阶段跟踪 (尽力而为, 失败不应中断建单/合并)
#[async_trait]
pub trait JobStageTracker: Send + Sync {
    /// 初始化阶段跟踪, 返回初始阶段
    async fn initialize(&self, job_id: i64, from_proposal: bool) -> Result<String, StoreError>;
}

pub struct PgJobStageTracker {
    pool: PgPool,
}

impl PgJobStageTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStageTracker for PgJobStageTracker {
    async fn initialize(&self, job_id: i64, from_proposal: bool) -> Result<String, StoreError> {
        let stage = JobStatus::NotScheduled.as_str();
        queries::upsert_job_stage(&self.pool, job_id, stage, from_proposal).await?;
        Ok(stage.to_string())
    }
}
