//! 测试用的内存存储, 模拟计费平台与固定数据

use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

use crate::db::SettlementStore;
use crate::error::{BillingError, StoreError};
use crate::models::{
    BillingStage, Customer, Invoice, Job, JobStatus, NewInvoice, NewJob, Proposal,
    ProposalLineItem, StageBilling, StageStatus, Tier, TierMode,
};
use crate::service::billing::{
    BillingPlatform, CounterpartyRecord, CreateCounterpartyRequest, CreateInvoiceRequest,
    CreatedInvoice,
};
use crate::service::stage_tracker::JobStageTracker;
use crate::service::tax::{CountyRate, RateTable, RateTableTaxResolver};

const JOB_NUMBER_CONSTRAINT: &str = "jobs_job_number_key";

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap_or_else(|_| BigDecimal::zero())
}

fn unavailable() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

// ---------------------------------------------------------------------------
// 固定数据
// ---------------------------------------------------------------------------

pub fn customer(id: i64, address: Option<&str>) -> Customer {
    Customer {
        id,
        name: "Pat Doe".to_string(),
        email: Some("pat@example.com".to_string()),
        phone: None,
        address: address.map(str::to_string),
        billing_external_id: None,
    }
}

/// 单档位报价单, 编号为 1000 + id
pub fn proposal(id: i64, customer_id: i64, title: &str) -> Proposal {
    Proposal {
        id,
        number: 1000 + id,
        customer_id,
        title: title.to_string(),
        tier_mode: TierMode::Single,
        subtotal: BigDecimal::zero(),
        total: BigDecimal::zero(),
        tax_rate: BigDecimal::zero(),
        selected_tier_id: None,
        deposit: StageBilling::default(),
        rough_in: StageBilling::default(),
        final_stage: StageBilling::default(),
        job_id: None,
        job_auto_created: false,
    }
}

pub fn item(
    id: i64,
    proposal_id: i64,
    tier_id: Option<i64>,
    price: &str,
    qty: &str,
    is_addon: bool,
    is_selected: bool,
) -> ProposalLineItem {
    let unit_price = dec(price);
    let quantity = dec(qty);
    ProposalLineItem {
        id,
        proposal_id,
        tier_id,
        description: format!("Item {}", id),
        total: &unit_price * &quantity,
        unit_price,
        quantity,
        is_addon,
        is_selected,
    }
}

/// IL 州税 4.75%, 62704 (Sangamon County) 县税 2.25%
pub fn tax_resolver() -> RateTableTaxResolver {
    let mut table = RateTable::default();
    table.states.insert("IL".to_string(), dec("0.0475"));
    table.counties.insert(
        "62704".to_string(),
        CountyRate {
            name: "Sangamon County".to_string(),
            rate: dec("0.0225"),
        },
    );
    RateTableTaxResolver::new(table, dec("0.05"))
}

// ---------------------------------------------------------------------------
// 内存存储
// ---------------------------------------------------------------------------

/// 内存版 SettlementStore
///
/// 工单号唯一性通过 `job_numbers` 的 entry 原子占位实现, 与数据库唯一约束语义一致.
#[derive(Default)]
pub struct InMemoryStore {
    next_id: AtomicI64,
    proposals: DashMap<i64, Proposal>,
    items: DashMap<i64, Vec<ProposalLineItem>>,
    tiers: DashMap<i64, Vec<Tier>>,
    customers: DashMap<i64, Customer>,
    invoices: DashMap<i64, Invoice>,
    jobs: DashMap<i64, Job>,
    job_numbers: DashMap<String, i64>,
    stage_claims: DashMap<(i64, BillingStage), DateTime<Utc>>,
    forced_conflicts: AtomicU32,
    fail_job_writes: AtomicBool,
    yield_on_number_reads: AtomicBool,
    job_read_barrier: Mutex<Option<Arc<Barrier>>>,
    job_read_waiters: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert_proposal(&self, proposal: Proposal) {
        self.proposals.insert(proposal.id, proposal);
    }

    pub fn insert_items(&self, items: Vec<ProposalLineItem>) {
        for item in items {
            self.items.entry(item.proposal_id).or_default().push(item);
        }
    }

    pub fn insert_tiers(&self, tiers: Vec<Tier>) {
        for tier in tiers {
            self.tiers.entry(tier.proposal_id).or_default().push(tier);
        }
    }

    pub fn insert_customer(&self, customer: Customer) {
        self.customers.insert(customer.id, customer);
    }

    /// 预置一个已有工单
    pub fn seed_job(
        &self,
        customer_id: i64,
        job_number: &str,
        title: &str,
        address: &str,
        status: JobStatus,
    ) -> Job {
        let job = Job {
            id: self.next_id(),
            job_number: job_number.to_string(),
            customer_id,
            title: title.to_string(),
            address: address.to_string(),
            status,
            notes: String::new(),
            proposal_links: Default::default(),
            invoice_links: Vec::new(),
            created_by: "seed".to_string(),
            created_at: Utc::now(),
            version: 0,
        };
        self.job_numbers.insert(job.job_number.clone(), job.id);
        self.jobs.insert(job.id, job.clone());
        job
    }

    pub fn proposal(&self, id: i64) -> Option<Proposal> {
        self.proposals.get(&id).map(|p| p.clone())
    }

    pub fn customer(&self, id: i64) -> Option<Customer> {
        self.customers.get(&id).map(|c| c.clone())
    }

    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn invoices(&self) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> = self.invoices.iter().map(|i| i.value().clone()).collect();
        invoices.sort_by_key(|i| i.id);
        invoices
    }

    /// 接下来 n 次建单时工单号被"并发请求"抢占
    pub fn force_job_number_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn fail_job_writes(&self, fail: bool) {
        self.fail_job_writes.store(fail, Ordering::SeqCst);
    }

    /// 读取最大工单号后让出执行权, 制造读-插入交错
    pub fn yield_on_number_reads(&self, enabled: bool) {
        self.yield_on_number_reads.store(enabled, Ordering::SeqCst);
    }

    /// 接下来 n 次工单读取 (列表或单个) 互相等待, 全部读完后才返回,
    /// 制造读取-写入交错. 只生效一轮.
    pub fn hold_job_reads(&self, n: usize) {
        self.job_read_waiters.store(n, Ordering::SeqCst);
        *self.job_read_barrier.lock().unwrap() = Some(Arc::new(Barrier::new(n)));
    }

    fn job_read_gate(&self) -> Option<Arc<Barrier>> {
        let mut slot = self.job_read_barrier.lock().unwrap();
        let barrier = slot.clone()?;
        if self.job_read_waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            *slot = None;
        }
        Some(barrier)
    }

    /// 让已有的阶段认领全部过期
    pub fn expire_stage_claims(&self) {
        for mut claim in self.stage_claims.iter_mut() {
            *claim.value_mut() = DateTime::<Utc>::MIN_UTC;
        }
    }

    fn check_job_writes(&self) -> Result<(), StoreError> {
        if self.fail_job_writes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }

    fn link_proposal(&self, proposal_id: i64, job_id: i64) -> Result<(), StoreError> {
        let mut proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or(StoreError::NotFound {
                entity: "proposal",
                id: proposal_id,
            })?;
        proposal.job_id = Some(job_id);
        proposal.job_auto_created = true;
        Ok(())
    }

    /// 版本一致时保存并加一, 与数据库的 `version = $n` 条件一致
    fn replace_job(&self, job: &Job) -> Result<bool, StoreError> {
        let mut stored = self.jobs.get_mut(&job.id).ok_or(StoreError::NotFound {
            entity: "job",
            id: job.id,
        })?;
        if stored.version != job.version {
            return Ok(false);
        }
        *stored = Job {
            version: job.version + 1,
            ..job.clone()
        };
        Ok(true)
    }
}

#[async_trait]
impl SettlementStore for InMemoryStore {
    async fn get_proposal(&self, proposal_id: i64) -> Result<Option<Proposal>, StoreError> {
        Ok(self.proposal(proposal_id))
    }

    async fn list_proposal_items(
        &self,
        proposal_id: i64,
    ) -> Result<Vec<ProposalLineItem>, StoreError> {
        Ok(self
            .items
            .get(&proposal_id)
            .map(|items| items.clone())
            .unwrap_or_default())
    }

    async fn list_tiers(&self, proposal_id: i64) -> Result<Vec<Tier>, StoreError> {
        let mut tiers = self
            .tiers
            .get(&proposal_id)
            .map(|tiers| tiers.clone())
            .unwrap_or_default();
        tiers.sort_by_key(|t| t.level);
        Ok(tiers)
    }

    async fn get_customer(&self, customer_id: i64) -> Result<Option<Customer>, StoreError> {
        Ok(self.customer(customer_id))
    }

    async fn save_customer_billing(&self, customer: &Customer) -> Result<(), StoreError> {
        let mut stored = self
            .customers
            .get_mut(&customer.id)
            .ok_or(StoreError::NotFound {
                entity: "customer",
                id: customer.id,
            })?;
        stored.billing_external_id = customer.billing_external_id.clone();
        stored.address = customer.address.clone();
        stored.phone = customer.phone.clone();
        Ok(())
    }

    async fn claim_stage(
        &self,
        proposal_id: i64,
        stage: BillingStage,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or(StoreError::NotFound {
                entity: "proposal",
                id: proposal_id,
            })?;
        let billing = proposal.billing_mut(stage);
        if billing.invoice_id.is_some() {
            return Ok(false);
        }
        let now = Utc::now();
        if billing.status == Some(StageStatus::Pending) {
            let fresh = self
                .stage_claims
                .get(&(proposal_id, stage))
                .and_then(|at| chrono::Duration::from_std(lease).ok().map(|l| *at + l > now))
                .unwrap_or(false);
            if fresh {
                return Ok(false);
            }
        }
        billing.status = Some(StageStatus::Pending);
        billing.note = None;
        self.stage_claims.insert((proposal_id, stage), now);
        Ok(true)
    }

    async fn record_stage_invoice(
        &self,
        invoice: &NewInvoice,
        stage: BillingStage,
        invoice_link: &str,
    ) -> Result<Invoice, StoreError> {
        let mut proposal = self
            .proposals
            .get_mut(&invoice.proposal_id)
            .ok_or(StoreError::NotFound {
                entity: "proposal",
                id: invoice.proposal_id,
            })?;
        if proposal.billing(stage).invoice_id.is_some() {
            return Err(StoreError::Corrupt(format!(
                "proposal {} already has a {} invoice, refusing to overwrite with {}",
                invoice.proposal_id, stage, invoice.external_id
            )));
        }

        let created = Invoice {
            id: self.next_id(),
            customer_id: invoice.customer_id,
            proposal_id: invoice.proposal_id,
            stage: invoice.stage.clone(),
            subtotal: invoice.subtotal.clone(),
            state_tax_amount: invoice.state_tax_amount.clone(),
            county_tax_amount: invoice.county_tax_amount.clone(),
            county: invoice.county.clone(),
            total: invoice.total.clone(),
            external_id: invoice.external_id.clone(),
            status: invoice.status.clone(),
            created_at: Utc::now(),
        };
        let billing = proposal.billing_mut(stage);
        billing.invoice_id = Some(invoice.external_id.clone());
        billing.invoice_link = Some(invoice_link.to_string());
        billing.status = Some(StageStatus::Sent);
        billing.note = None;
        self.stage_claims.remove(&(invoice.proposal_id, stage));
        self.invoices.insert(created.id, created.clone());
        Ok(created)
    }

    async fn record_stage_failed(
        &self,
        proposal_id: i64,
        stage: BillingStage,
        note: &str,
    ) -> Result<(), StoreError> {
        let mut proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or(StoreError::NotFound {
                entity: "proposal",
                id: proposal_id,
            })?;
        let billing = proposal.billing_mut(stage);
        billing.status = Some(StageStatus::Failed);
        billing.note = Some(note.to_string());
        self.stage_claims.remove(&(proposal_id, stage));
        Ok(())
    }

    async fn list_open_jobs(&self, customer_id: i64) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.customer_id == customer_id && !j.status.is_terminal())
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        if let Some(barrier) = self.job_read_gate() {
            barrier.wait().await;
        }
        Ok(jobs)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let job = self.jobs.get(&job_id).map(|j| j.clone());
        if let Some(barrier) = self.job_read_gate() {
            barrier.wait().await;
        }
        Ok(job)
    }

    async fn latest_job_number(&self, prefix: &str) -> Result<Option<String>, StoreError> {
        let latest = self
            .job_numbers
            .iter()
            .map(|n| n.key().clone())
            .filter(|n| n.starts_with(prefix))
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        if self.yield_on_number_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(latest)
    }

    async fn create_job_for_proposal(
        &self,
        job: &NewJob,
        proposal_id: i64,
    ) -> Result<Job, StoreError> {
        self.check_job_writes()?;

        let conflict = StoreError::UniqueViolation {
            constraint: Some(JOB_NUMBER_CONSTRAINT.to_string()),
        };
        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            // 模拟另一个请求抢先插入了同一个号
            self.job_numbers.insert(job.job_number.clone(), 0);
            return Err(conflict);
        }

        let id = match self.job_numbers.entry(job.job_number.clone()) {
            Entry::Occupied(_) => return Err(conflict),
            Entry::Vacant(slot) => {
                let id = self.next_id();
                slot.insert(id);
                id
            }
        };

        if let Err(e) = self.link_proposal(proposal_id, id) {
            self.job_numbers.remove(&job.job_number);
            return Err(e);
        }

        let created = Job {
            id,
            job_number: job.job_number.clone(),
            customer_id: job.customer_id,
            title: job.title.clone(),
            address: job.address.clone(),
            status: JobStatus::NotScheduled,
            notes: job.notes.clone(),
            proposal_links: job.proposal_links.clone(),
            invoice_links: job.invoice_links.clone(),
            created_by: job.created_by.clone(),
            created_at: Utc::now(),
            version: 0,
        };
        self.jobs.insert(id, created.clone());
        Ok(created)
    }

    async fn merge_job_for_proposal(
        &self,
        job: &Job,
        proposal_id: i64,
    ) -> Result<bool, StoreError> {
        self.check_job_writes()?;
        if !self.proposals.contains_key(&proposal_id) {
            return Err(StoreError::NotFound {
                entity: "proposal",
                id: proposal_id,
            });
        }
        if !self.replace_job(job)? {
            return Ok(false);
        }
        self.link_proposal(proposal_id, job.id)?;
        Ok(true)
    }

    async fn update_job(&self, job: &Job) -> Result<bool, StoreError> {
        self.check_job_writes()?;
        self.replace_job(job)
    }
}

// ---------------------------------------------------------------------------
// 模拟计费平台
// ---------------------------------------------------------------------------

struct SeededCustomer {
    name: String,
    email: Option<String>,
    record: CounterpartyRecord,
}

#[derive(Default)]
pub struct MockBillingPlatform {
    counter: AtomicU64,
    customers: Mutex<Vec<SeededCustomer>>,
    customer_creations: AtomicU32,
    customer_calls: AtomicU32,
    invoice_requests: Mutex<Vec<CreateInvoiceRequest>>,
    fail_customer_calls: AtomicBool,
    fail_invoice_calls: AtomicBool,
    latency_ms: AtomicU64,
}

impl MockBillingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_customer(&self, name: &str, email: Option<&str>, record: CounterpartyRecord) {
        self.customers.lock().unwrap().push(SeededCustomer {
            name: name.to_string(),
            email: email.map(str::to_string),
            record,
        });
    }

    pub fn customer_creations(&self) -> u32 {
        self.customer_creations.load(Ordering::SeqCst)
    }

    /// 所有客户相关调用次数 (查询/查找/创建)
    pub fn customer_calls(&self) -> u32 {
        self.customer_calls.load(Ordering::SeqCst)
    }

    pub fn invoice_requests(&self) -> Vec<CreateInvoiceRequest> {
        self.invoice_requests.lock().unwrap().clone()
    }

    pub fn fail_customer_calls(&self, fail: bool) {
        self.fail_customer_calls.store(fail, Ordering::SeqCst);
    }

    pub fn fail_invoice_calls(&self, fail: bool) {
        self.fail_invoice_calls.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn customer_call(&self, operation: &str) -> Result<(), BillingError> {
        self.customer_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_customer_calls.load(Ordering::SeqCst) {
            return Err(BillingError::Transport {
                operation: operation.to_string(),
                message: "connection reset".to_string(),
            });
        }
        Ok(())
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl BillingPlatform for MockBillingPlatform {
    async fn get_customer(&self, external_id: &str) -> Result<CounterpartyRecord, BillingError> {
        self.customer_call("get_customer").await?;
        self.customers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.record.external_id == external_id)
            .map(|c| c.record.clone())
            .ok_or_else(|| BillingError::Rejected {
                operation: "get_customer".to_string(),
                message: format!("no such customer: {}", external_id),
            })
    }

    async fn find_customer(
        &self,
        name: &str,
        email: Option<&str>,
    ) -> Result<Option<CounterpartyRecord>, BillingError> {
        self.customer_call("find_customer").await?;
        let customers = self.customers.lock().unwrap();
        let by_email = email.and_then(|email| {
            customers
                .iter()
                .find(|c| c.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)))
        });
        let found = by_email.or_else(|| {
            customers
                .iter()
                .find(|c| c.email.is_none() && c.name.eq_ignore_ascii_case(name))
        });
        Ok(found.map(|c| c.record.clone()))
    }

    async fn create_customer(
        &self,
        request: CreateCounterpartyRequest,
    ) -> Result<CounterpartyRecord, BillingError> {
        self.customer_call("create_customer").await?;
        let record = CounterpartyRecord {
            external_id: format!("cus_{}", self.next()),
            canonical_address: request.address.clone(),
            canonical_phone: request.phone.clone(),
        };
        self.customer_creations.fetch_add(1, Ordering::SeqCst);
        self.seed_customer(&request.name, request.email.as_deref(), record.clone());
        Ok(record)
    }

    async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<CreatedInvoice, BillingError> {
        self.delay().await;
        if self.fail_invoice_calls.load(Ordering::SeqCst) {
            return Err(BillingError::Rejected {
                operation: "create_invoice".to_string(),
                message: "customer has no billing address".to_string(),
            });
        }
        let id = format!("inv_{}", self.next());
        self.invoice_requests.lock().unwrap().push(request);
        Ok(CreatedInvoice {
            customer_facing_url: format!("https://billing.example.com/i/{}", id),
            external_invoice_id: id,
        })
    }
}

// ---------------------------------------------------------------------------
// 阶段跟踪
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingStageTracker {
    initialized: Mutex<Vec<i64>>,
    fail: AtomicBool,
}

impl RecordingStageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn initialized(&self) -> Vec<i64> {
        self.initialized.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStageTracker for RecordingStageTracker {
    async fn initialize(&self, job_id: i64, _from_proposal: bool) -> Result<String, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.initialized.lock().unwrap().push(job_id);
        Ok(JobStatus::NotScheduled.as_str().to_string())
    }
}
