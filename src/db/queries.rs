use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;

use crate::error::StoreError;
use crate::models::{
    BillingStage, Customer, Invoice, Job, JobRow, NewInvoice, NewJob, Proposal, ProposalLineItem,
    ProposalRow, Tier,
};

const PROPOSAL_COLUMNS: &str = r#"
    id, number, customer_id, title, tier_mode, subtotal, total, tax_rate, selected_tier_id,
    deposit_invoice_id, deposit_invoice_link, deposit_status, deposit_note,
    rough_in_invoice_id, rough_in_invoice_link, rough_in_status, rough_in_note,
    final_invoice_id, final_invoice_link, final_status, final_note,
    job_id, job_auto_created
"#;

const JOB_COLUMNS: &str = r#"
    id, job_number, customer_id, title, address, status, notes,
    proposal_links, invoice_links, created_by, created_at, version
"#;

/// 查询报价单
pub async fn get_proposal(pool: &PgPool, proposal_id: i64) -> Result<Option<Proposal>, StoreError> {
    let sql = format!("SELECT {} FROM proposals WHERE id = $1", PROPOSAL_COLUMNS);
    sqlx::query_as::<_, ProposalRow>(&sql)
        .bind(proposal_id)
        .fetch_optional(pool)
        .await?
        .map(Proposal::try_from)
        .transpose()
}

/// 查询报价明细
pub async fn list_proposal_items(
    pool: &PgPool,
    proposal_id: i64,
) -> Result<Vec<ProposalLineItem>, StoreError> {
    let items = sqlx::query_as::<_, ProposalLineItem>(
        r#"
        SELECT id, proposal_id, tier_id, description, unit_price, quantity, total,
               is_addon, is_selected
        FROM proposal_line_items
        WHERE proposal_id = $1
        ORDER BY id
        "#,
    )
    .bind(proposal_id)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

pub async fn list_tiers(pool: &PgPool, proposal_id: i64) -> Result<Vec<Tier>, StoreError> {
    let tiers = sqlx::query_as::<_, Tier>(
        r#"
        SELECT id, proposal_id, level, name, is_selected
        FROM proposal_tiers
        WHERE proposal_id = $1
        ORDER BY level
        "#,
    )
    .bind(proposal_id)
    .fetch_all(pool)
    .await?;
    Ok(tiers)
}

pub async fn get_customer(pool: &PgPool, customer_id: i64) -> Result<Option<Customer>, StoreError> {
    let customer = sqlx::query_as::<_, Customer>(
        r#"
        SELECT id, name, email, phone, address, billing_external_id
        FROM customers
        WHERE id = $1
        "#,
    )
    .bind(customer_id)
    .fetch_optional(pool)
    .await?;
    Ok(customer)
}

/// 写回计费平台同步后的客户字段
pub async fn save_customer_billing(pool: &PgPool, customer: &Customer) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE customers
        SET billing_external_id = $2, address = $3, phone = $4, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(customer.id)
    .bind(&customer.billing_external_id)
    .bind(&customer.address)
    .bind(&customer.phone)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "customer",
            id: customer.id,
        });
    }
    Ok(())
}

/// 认领阶段开票: 该阶段尚无发票, 且没有未过期的 PENDING 认领时成功.
///
/// 返回 false 表示已开票或另一个请求正在开票.
pub async fn claim_stage(
    pool: &PgPool,
    proposal_id: i64,
    stage: BillingStage,
    lease: Duration,
) -> Result<bool, StoreError> {
    let p = stage.as_str();
    let sql = format!(
        "UPDATE proposals SET {p}_status = 'PENDING', {p}_note = NULL, {p}_claimed_at = now(), \
         updated_at = now() \
         WHERE id = $1 AND {p}_invoice_id IS NULL \
           AND ({p}_status IS DISTINCT FROM 'PENDING' \
                OR {p}_claimed_at IS NULL \
                OR {p}_claimed_at < now() - make_interval(secs => $2)) \
         RETURNING id"
    );
    let claimed = sqlx::query_scalar::<_, i64>(&sql)
        .bind(proposal_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(pool)
        .await?;
    Ok(claimed.is_some())
}

/// 在一个事务内写入本地发票并更新报价单的阶段开票字段
///
/// 阶段上已有发票号时不覆盖, 返回 `StoreError::Corrupt` 并回滚.
pub async fn record_stage_invoice(
    pool: &PgPool,
    invoice: &NewInvoice,
    stage: BillingStage,
    invoice_link: &str,
) -> Result<Invoice, StoreError> {
    let mut tx = pool.begin().await?;

    let created = sqlx::query_as::<_, Invoice>(
        r#"
        INSERT INTO invoices (
            customer_id, proposal_id, stage, subtotal,
            state_tax_amount, county_tax_amount, county, total,
            external_id, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id, customer_id, proposal_id, stage, subtotal,
                  state_tax_amount, county_tax_amount, county, total,
                  external_id, status, created_at
        "#,
    )
    .bind(invoice.customer_id)
    .bind(invoice.proposal_id)
    .bind(&invoice.stage)
    .bind(&invoice.subtotal)
    .bind(&invoice.state_tax_amount)
    .bind(&invoice.county_tax_amount)
    .bind(&invoice.county)
    .bind(&invoice.total)
    .bind(&invoice.external_id)
    .bind(&invoice.status)
    .fetch_one(&mut *tx)
    .await?;

    let p = stage.as_str();
    let sql = format!(
        "UPDATE proposals SET {p}_invoice_id = $2, {p}_invoice_link = $3, {p}_status = 'SENT', \
         {p}_note = NULL, {p}_claimed_at = NULL, updated_at = now() \
         WHERE id = $1 AND {p}_invoice_id IS NULL"
    );
    let result = sqlx::query(&sql)
        .bind(invoice.proposal_id)
        .bind(&invoice.external_id)
        .bind(invoice_link)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Corrupt(format!(
            "proposal {} already has a {} invoice, refusing to overwrite with {}",
            invoice.proposal_id, stage, invoice.external_id
        )));
    }

    tx.commit().await?;
    tracing::debug!(invoice_id = created.id, stage = %stage, "local invoice recorded");
    Ok(created)
}

/// 标记阶段开票失败 (附诊断说明)
pub async fn record_stage_failed(
    pool: &PgPool,
    proposal_id: i64,
    stage: BillingStage,
    note: &str,
) -> Result<(), StoreError> {
    let p = stage.as_str();
    let sql = format!(
        "UPDATE proposals SET {p}_status = 'FAILED', {p}_note = $2, {p}_claimed_at = NULL, \
         updated_at = now() WHERE id = $1"
    );
    sqlx::query(&sql)
        .bind(proposal_id)
        .bind(note)
        .execute(pool)
        .await?;
    Ok(())
}

/// 客户名下未取消/未归档的工单, 新的在前
pub async fn list_open_jobs(pool: &PgPool, customer_id: i64) -> Result<Vec<Job>, StoreError> {
    let sql = format!(
        "SELECT {} FROM jobs WHERE customer_id = $1 AND status NOT IN ('cancelled', 'archived') \
         ORDER BY created_at DESC, id DESC",
        JOB_COLUMNS
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(customer_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(Job::try_from)
        .collect()
}

pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .map(Job::try_from)
        .transpose()
}

/// 指定前缀下的最大工单号 (先按长度, 序号超过 999 时仍然有序)
pub async fn latest_job_number(pool: &PgPool, prefix: &str) -> Result<Option<String>, StoreError> {
    let number = sqlx::query_scalar::<_, String>(
        r#"
        SELECT job_number
        FROM jobs
        WHERE job_number LIKE $1 || '%'
        ORDER BY length(job_number) DESC, job_number DESC
        LIMIT 1
        "#,
    )
    .bind(prefix)
    .fetch_optional(pool)
    .await?;
    Ok(number)
}

/// 插入新工单并把报价单标记为已自动建单 (同一事务)
///
/// 工单号冲突时返回 `StoreError::UniqueViolation`, 由调用方重试.
pub async fn create_job_for_proposal(
    pool: &PgPool,
    job: &NewJob,
    proposal_id: i64,
) -> Result<Job, StoreError> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        "INSERT INTO jobs (job_number, customer_id, title, address, status, notes, \
         proposal_links, invoice_links, created_by) \
         VALUES ($1, $2, $3, $4, 'not_scheduled', $5, $6, $7, $8) RETURNING {}",
        JOB_COLUMNS
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(&job.job_number)
        .bind(job.customer_id)
        .bind(&job.title)
        .bind(&job.address)
        .bind(&job.notes)
        .bind(Json(&job.proposal_links))
        .bind(Json(&job.invoice_links))
        .bind(&job.created_by)
        .fetch_one(&mut *tx)
        .await?;

    link_proposal(&mut tx, proposal_id, row.id).await?;
    tx.commit().await?;

    Job::try_from(row)
}

/// 保存合并后的工单并把报价单指向它 (同一事务)
///
/// `job.version` 是读取时的版本; 期间被其他请求修改过则不写入, 返回 false.
pub async fn merge_job_for_proposal(
    pool: &PgPool,
    job: &Job,
    proposal_id: i64,
) -> Result<bool, StoreError> {
    let mut tx = pool.begin().await?;
    if !update_job_in(&mut tx, job).await? {
        return Ok(false);
    }
    link_proposal(&mut tx, proposal_id, job.id).await?;
    tx.commit().await?;
    Ok(true)
}

pub async fn update_job(pool: &PgPool, job: &Job) -> Result<bool, StoreError> {
    let mut tx = pool.begin().await?;
    if !update_job_in(&mut tx, job).await? {
        return Ok(false);
    }
    tx.commit().await?;
    Ok(true)
}

async fn update_job_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &Job,
) -> Result<bool, StoreError> {
    let updated = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE jobs
        SET title = $2, status = $3, notes = $4, proposal_links = $5, invoice_links = $6,
            version = version + 1, updated_at = now()
        WHERE id = $1 AND version = $7
        RETURNING id
        "#,
    )
    .bind(job.id)
    .bind(&job.title)
    .bind(job.status.as_str())
    .bind(&job.notes)
    .bind(Json(&job.proposal_links))
    .bind(Json(&job.invoice_links))
    .bind(job.version)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(updated.is_some())
}

async fn link_proposal(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    proposal_id: i64,
    job_id: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE proposals
        SET job_id = $2, job_auto_created = true, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(proposal_id)
    .bind(job_id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "proposal",
            id: proposal_id,
        });
    }
    Ok(())
}

/// 记录工单初始阶段
pub async fn upsert_job_stage(
    pool: &PgPool,
    job_id: i64,
    stage: &str,
    from_proposal: bool,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_stages (job_id, stage, from_proposal)
        VALUES ($1, $2, $3)
        ON CONFLICT (job_id) DO UPDATE
        SET stage = EXCLUDED.stage, from_proposal = EXCLUDED.from_proposal, initialized_at = now()
        "#,
    )
    .bind(job_id)
    .bind(stage)
    .bind(from_proposal)
    .execute(pool)
    .await?;
    Ok(())
}
