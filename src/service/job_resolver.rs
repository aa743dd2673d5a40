use chrono::{Local, NaiveDate, Utc};
use std::sync::Arc;

use crate::config::SettlementConfig;
use crate::db::SettlementStore;
use crate::error::{Result, SettlementError, StoreError};
use crate::models::{
    Customer, InvoiceLink, Job, JobResolution, JobStatus, NewJob, Proposal, StageInvoice,
};
use crate::service::address::{match_address, AddressMatch};
use crate::service::stage_tracker::JobStageTracker;

/// 合并时标题的分隔符
pub const TITLE_SEPARATOR: &str = " + ";

/// 工单被并发修改时, 重新读取再写入的次数上限
const JOB_UPDATE_ATTEMPTS: u32 = 5;

/// 当天工单号前缀, 例如 JOB-20260315-
pub fn job_number_prefix(date: NaiveDate) -> String {
    format!("JOB-{}-", date.format("%Y%m%d"))
}

/// 在当天最大工单号基础上加一
pub fn next_job_number(prefix: &str, latest: Option<&str>) -> String {
    let seq = latest
        .and_then(|n| n.strip_prefix(prefix))
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    format!("{}{:03}", prefix, seq + 1)
}

type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// 工单解析/合并
pub struct JobResolver {
    store: Arc<dyn SettlementStore>,
    tracker: Arc<dyn JobStageTracker>,
    config: SettlementConfig,
    today: Clock,
}

impl JobResolver {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        tracker: Arc<dyn JobStageTracker>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            config,
            today: Arc::new(|| Local::now().date_naive()),
        }
    }

    /// 替换日期来源 (测试用)
    pub fn with_clock(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    fn invoice_link(invoice: &StageInvoice) -> InvoiceLink {
        InvoiceLink {
            url: invoice.invoice_link.clone(),
            stage: invoice.stage,
            stage_fraction: invoice.stage_fraction.clone(),
            invoice_ids: vec![invoice.external_invoice_id.clone()],
            created_at: Utc::now(),
        }
    }

    /// 为本次审批决定新建工单还是合并到同地址的已有工单
    pub async fn resolve_job(
        &self,
        proposal: &Proposal,
        customer: &Customer,
        invoice: &StageInvoice,
    ) -> Result<JobResolution> {
        if let Some(job_id) = proposal.job_id {
            return self.attach_to_linked(job_id, invoice).await;
        }
        if proposal.job_auto_created {
            tracing::warn!(
                proposal_id = proposal.id,
                "job_auto_created set without linked job, skipping job resolution"
            );
            return Ok(JobResolution::Skipped);
        }

        let address = customer
            .service_address()
            .ok_or(SettlementError::MissingAddress {
                customer_id: customer.id,
            })?;

        let jobs: Vec<Job> = self
            .store
            .list_open_jobs(customer.id)
            .await?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect();

        match match_address(address, &jobs, self.config.match_threshold) {
            Some(found) => {
                let job = jobs
                    .into_iter()
                    .find(|j| j.id == found.job_id)
                    .ok_or(StoreError::NotFound {
                        entity: "job",
                        id: found.job_id,
                    })?;
                self.merge(job, &found, proposal, invoice).await
            }
            None => self.create(proposal, customer, address, invoice).await,
        }
    }

    async fn load_job(&self, job_id: i64) -> Result<Job> {
        Ok(self
            .store
            .get_job(job_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "job",
                id: job_id,
            })?)
    }

    async fn attach_to_linked(&self, job_id: i64, invoice: &StageInvoice) -> Result<JobResolution> {
        for attempt in 1..=JOB_UPDATE_ATTEMPTS {
            let mut job = self.load_job(job_id).await?;
            if invoice.invoice_link.is_empty()
                || !job.attach_invoice_link(Self::invoice_link(invoice))
            {
                return Ok(JobResolution::Linked(job));
            }
            if self.store.update_job(&job).await? {
                job.version += 1;
                tracing::info!(job_id, "Invoice link appended to linked job");
                return Ok(JobResolution::Linked(job));
            }
            tracing::debug!(job_id, attempt, "linked job changed concurrently, re-reading");
        }
        Err(SettlementError::JobUpdateConflict {
            job_id,
            attempts: JOB_UPDATE_ATTEMPTS,
        })
    }

    /// 在读取到的工单上追加本次审批的内容 (不写库)
    fn apply_merge(
        &self,
        job: &mut Job,
        found: &AddressMatch,
        proposal: &Proposal,
        invoice: &StageInvoice,
    ) {
        job.proposal_links
            .insert(self.config.proposal_link(proposal.id));
        if !invoice.invoice_link.is_empty() {
            job.attach_invoice_link(Self::invoice_link(invoice));
        }
        job.title = format!("{}{}{}", job.title, TITLE_SEPARATOR, proposal.title);
        job.append_note(&format!(
            "[{}] Merged proposal #{} \"{}\" (address match {:.2}, {:?} confidence)",
            Utc::now().format("%Y-%m-%d %H:%M UTC"),
            proposal.number,
            proposal.title,
            found.score,
            found.confidence,
        ));
        job.status = JobStatus::NotScheduled;
    }

    /// 合并写入带版本条件; 其他审批先一步修改了工单时重新读取再合并
    async fn merge(
        &self,
        listed: Job,
        found: &AddressMatch,
        proposal: &Proposal,
        invoice: &StageInvoice,
    ) -> Result<JobResolution> {
        let job_id = listed.id;
        let mut current = listed;
        for attempt in 1..=JOB_UPDATE_ATTEMPTS {
            let mut job = current;
            self.apply_merge(&mut job, found, proposal, invoice);

            if self.store.merge_job_for_proposal(&job, proposal.id).await? {
                job.version += 1;
                tracing::info!(
                    proposal_id = proposal.id,
                    job_id,
                    job_number = %job.job_number,
                    score = found.score,
                    attempt,
                    "✓ Proposal merged into existing job"
                );
                self.initialize_stages(job_id).await;
                return Ok(JobResolution::Merged(job));
            }

            tracing::warn!(
                proposal_id = proposal.id,
                job_id,
                attempt,
                "Job changed by a concurrent approval, re-reading before merge"
            );
            current = self.load_job(job_id).await?;
        }

        tracing::error!(proposal_id = proposal.id, job_id, "✗ Job merge kept conflicting");
        Err(SettlementError::JobUpdateConflict {
            job_id,
            attempts: JOB_UPDATE_ATTEMPTS,
        })
    }

    async fn create(
        &self,
        proposal: &Proposal,
        customer: &Customer,
        address: &str,
        invoice: &StageInvoice,
    ) -> Result<JobResolution> {
        let prefix = job_number_prefix((self.today)());
        let mut proposal_links = indexmap::IndexSet::new();
        proposal_links.insert(self.config.proposal_link(proposal.id));
        let invoice_links = if invoice.invoice_link.is_empty() {
            Vec::new()
        } else {
            vec![Self::invoice_link(invoice)]
        };

        let attempts = self.config.job_number_attempts.max(1);
        for attempt in 1..=attempts {
            let latest = self.store.latest_job_number(&prefix).await?;
            let new_job = NewJob {
                job_number: next_job_number(&prefix, latest.as_deref()),
                customer_id: customer.id,
                title: proposal.title.clone(),
                address: address.to_string(),
                notes: String::new(),
                proposal_links: proposal_links.clone(),
                invoice_links: invoice_links.clone(),
                created_by: self.config.created_by.clone(),
            };

            match self.store.create_job_for_proposal(&new_job, proposal.id).await {
                Ok(job) => {
                    tracing::info!(
                        proposal_id = proposal.id,
                        job_id = job.id,
                        job_number = %job.job_number,
                        attempt,
                        "✓ Job created"
                    );
                    self.initialize_stages(job.id).await;
                    return Ok(JobResolution::Created(job));
                }
                Err(StoreError::UniqueViolation { .. }) if attempt < attempts => {
                    let delay = self.config.job_number_backoff() * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        proposal_id = proposal.id,
                        job_number = %new_job.job_number,
                        attempt,
                        "Job number taken by a concurrent approval, retrying after {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(StoreError::UniqueViolation { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            proposal_id = proposal.id,
            attempts,
            "✗ Job number generation exhausted"
        );
        Err(SettlementError::JobNumberExhausted { attempts })
    }

    async fn initialize_stages(&self, job_id: i64) {
        match self.tracker.initialize(job_id, true).await {
            Ok(stage) => tracing::debug!(job_id, stage = %stage, "job stage tracking initialized"),
            Err(e) => tracing::warn!(job_id, "job stage tracking initialization failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BillingStage;
    use crate::testing::{customer, proposal, InMemoryStore, RecordingStageTracker};
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    const ADDRESS: &str = "123 Main Street, Springfield, IL 62704";

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 15).unwrap()
    }

    fn stage_invoice(n: u32) -> StageInvoice {
        StageInvoice {
            stage: BillingStage::Deposit,
            stage_fraction: BigDecimal::from_str("0.5").unwrap(),
            external_invoice_id: format!("inv_{}", n),
            invoice_link: format!("https://billing.example.com/i/inv_{}", n),
            local_invoice_id: Some(n as i64),
            subtotal: None,
            total: None,
            reused: false,
        }
    }

    fn resolver_with(
        store: Arc<InMemoryStore>,
        tracker: Arc<RecordingStageTracker>,
        config: SettlementConfig,
    ) -> JobResolver {
        JobResolver::new(store, tracker, config).with_clock(day)
    }

    fn resolver(store: Arc<InMemoryStore>) -> JobResolver {
        resolver_with(
            store,
            Arc::new(RecordingStageTracker::new()),
            SettlementConfig {
                job_number_backoff_ms: 1,
                ..SettlementConfig::default()
            },
        )
    }

    #[test]
    fn job_numbers_increment_per_day() {
        let prefix = job_number_prefix(day());
        assert_eq!(prefix, "JOB-20260315-");
        assert_eq!(next_job_number(&prefix, None), "JOB-20260315-001");
        assert_eq!(
            next_job_number(&prefix, Some("JOB-20260315-041")),
            "JOB-20260315-042"
        );
        assert_eq!(
            next_job_number(&prefix, Some("JOB-20260315-999")),
            "JOB-20260315-1000"
        );
    }

    #[tokio::test]
    async fn creates_job_when_no_address_match() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        let c = customer(1, Some(ADDRESS));

        let p = store.proposal(1).unwrap();
        let resolution = resolver(store.clone())
            .resolve_job(&p, &c, &stage_invoice(1))
            .await
            .unwrap();

        let JobResolution::Created(job) = resolution else {
            panic!("expected a created job");
        };
        assert_eq!(job.job_number, "JOB-20260315-001");
        assert_eq!(job.title, "Panel replacement");
        assert_eq!(job.invoice_links.len(), 1);
        assert_eq!(job.status, JobStatus::NotScheduled);

        let stored = store.proposal(1).unwrap();
        assert!(stored.job_auto_created);
        assert_eq!(stored.job_id, Some(job.id));
    }

    #[tokio::test]
    async fn merges_into_job_at_same_address() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        store.insert_proposal(proposal(2, 1, "EV charger"));
        let c = customer(1, Some(ADDRESS));
        let r = resolver(store.clone());

        let first = r
            .resolve_job(&store.proposal(1).unwrap(), &c, &stage_invoice(1))
            .await
            .unwrap();

        let mut moved = c.clone();
        moved.address = Some("123 Main St, Apt 2, Springfield, IL 62704".to_string());
        let second = r
            .resolve_job(&store.proposal(2).unwrap(), &moved, &stage_invoice(2))
            .await
            .unwrap();

        assert!(second.merged());
        let job = second.job().unwrap();
        assert_eq!(job.id, first.job().unwrap().id);
        assert_eq!(job.title, "Panel replacement + EV charger");
        assert_eq!(job.proposal_links.len(), 2);
        assert_eq!(job.invoice_links.len(), 2);
        assert!(job.notes.contains("Merged proposal #1002"));
        assert_eq!(store.jobs().len(), 1);
        assert_eq!(store.proposal(2).unwrap().job_id, Some(job.id));
    }

    #[tokio::test]
    async fn merge_resets_status_to_not_scheduled() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        let existing = store.seed_job(
            1,
            "JOB-20260301-001",
            "Lighting retrofit",
            ADDRESS,
            JobStatus::InProgress,
        );
        let c = customer(1, Some(ADDRESS));

        let resolution = resolver(store.clone())
            .resolve_job(&store.proposal(1).unwrap(), &c, &stage_invoice(1))
            .await
            .unwrap();

        let job = resolution.job().unwrap();
        assert_eq!(job.id, existing.id);
        assert_eq!(job.status, JobStatus::NotScheduled);
    }

    #[tokio::test]
    async fn cancelled_jobs_are_not_merge_targets() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        store.seed_job(1, "JOB-20260301-001", "Old work", ADDRESS, JobStatus::Cancelled);
        let c = customer(1, Some(ADDRESS));

        let resolution = resolver(store.clone())
            .resolve_job(&store.proposal(1).unwrap(), &c, &stage_invoice(1))
            .await
            .unwrap();

        assert!(matches!(resolution, JobResolution::Created(_)));
    }

    #[tokio::test]
    async fn linked_proposal_only_appends_new_invoice_link() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        let c = customer(1, Some(ADDRESS));
        let r = resolver(store.clone());

        r.resolve_job(&store.proposal(1).unwrap(), &c, &stage_invoice(1))
            .await
            .unwrap();

        let linked = store.proposal(1).unwrap();
        let again = r.resolve_job(&linked, &c, &stage_invoice(1)).await.unwrap();
        assert!(matches!(again, JobResolution::Linked(_)));
        assert!(!again.merged());
        assert_eq!(again.job().unwrap().invoice_links.len(), 1);

        let mut rough_in = stage_invoice(2);
        rough_in.stage = BillingStage::RoughIn;
        let later = r.resolve_job(&linked, &c, &rough_in).await.unwrap();
        assert_eq!(later.job().unwrap().invoice_links.len(), 2);
        assert_eq!(store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn auto_created_without_link_is_a_no_op() {
        let store = Arc::new(InMemoryStore::new());
        let mut p = proposal(1, 1, "Panel replacement");
        p.job_auto_created = true;
        store.insert_proposal(p.clone());

        let resolution = resolver(store.clone())
            .resolve_job(&p, &customer(1, Some(ADDRESS)), &stage_invoice(1))
            .await
            .unwrap();

        assert_eq!(resolution, JobResolution::Skipped);
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn retries_job_number_conflicts() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        store.force_job_number_conflicts(2);

        let resolution = resolver(store.clone())
            .resolve_job(
                &store.proposal(1).unwrap(),
                &customer(1, Some(ADDRESS)),
                &stage_invoice(1),
            )
            .await
            .unwrap();

        // 两个号被并发审批占用, 第三次拿到 003
        assert_eq!(resolution.job().unwrap().job_number, "JOB-20260315-003");
    }

    #[tokio::test]
    async fn exhausted_retries_fail_loudly_and_leave_proposal_unflagged() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        store.force_job_number_conflicts(3);

        let err = resolver(store.clone())
            .resolve_job(
                &store.proposal(1).unwrap(),
                &customer(1, Some(ADDRESS)),
                &stage_invoice(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::JobNumberExhausted { attempts: 3 }));
        let stored = store.proposal(1).unwrap();
        assert!(!stored.job_auto_created);
        assert!(stored.job_id.is_none());
    }

    #[tokio::test]
    async fn stage_tracker_failure_does_not_abort_creation() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        let tracker = Arc::new(RecordingStageTracker::new());
        tracker.fail(true);

        let resolution = resolver_with(store.clone(), tracker.clone(), SettlementConfig::default())
            .resolve_job(
                &store.proposal(1).unwrap(),
                &customer(1, Some(ADDRESS)),
                &stage_invoice(1),
            )
            .await
            .unwrap();

        assert!(matches!(resolution, JobResolution::Created(_)));
        assert!(tracker.initialized().is_empty());
    }

    #[tokio::test]
    async fn concurrent_merges_into_same_job_keep_both_proposals() {
        let store = Arc::new(InMemoryStore::new());
        let existing = store.seed_job(
            1,
            "JOB-20260301-001",
            "Lighting retrofit",
            ADDRESS,
            JobStatus::Scheduled,
        );
        store.insert_proposal(proposal(2, 1, "EV charger"));
        store.insert_proposal(proposal(3, 1, "Generator install"));
        let (p2, p3) = (store.proposal(2).unwrap(), store.proposal(3).unwrap());
        let c = customer(1, Some(ADDRESS));
        let r = resolver(store.clone());

        // 两个审批都在对方写入之前读到同一版本的工单
        store.hold_job_reads(2);
        let (inv2, inv3) = (stage_invoice(2), stage_invoice(3));
        let (a, b) = tokio::join!(
            r.resolve_job(&p2, &c, &inv2),
            r.resolve_job(&p3, &c, &inv3),
        );
        assert!(a.unwrap().merged());
        assert!(b.unwrap().merged());

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert!(job.title.starts_with("Lighting retrofit + "));
        assert!(job.title.contains("EV charger"));
        assert!(job.title.contains("Generator install"));
        assert_eq!(job.proposal_links.len(), 2);
        assert_eq!(job.invoice_links.len(), 2);
        assert_eq!(job.version, 2);
        assert_eq!(store.proposal(2).unwrap().job_id, Some(existing.id));
        assert_eq!(store.proposal(3).unwrap().job_id, Some(existing.id));
    }

    #[tokio::test]
    async fn concurrent_stage_links_are_both_kept() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_proposal(proposal(1, 1, "Panel replacement"));
        let c = customer(1, Some(ADDRESS));
        let r = resolver(store.clone());
        r.resolve_job(&store.proposal(1).unwrap(), &c, &stage_invoice(1))
            .await
            .unwrap();
        let linked = store.proposal(1).unwrap();

        let mut rough_in = stage_invoice(2);
        rough_in.stage = BillingStage::RoughIn;
        let mut final_stage = stage_invoice(3);
        final_stage.stage = BillingStage::Final;

        store.hold_job_reads(2);
        let (a, b) = tokio::join!(
            r.resolve_job(&linked, &c, &rough_in),
            r.resolve_job(&linked, &c, &final_stage),
        );
        a.unwrap();
        b.unwrap();

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        let stages: Vec<BillingStage> = jobs[0].invoice_links.iter().map(|l| l.stage).collect();
        assert_eq!(stages.len(), 3);
        assert!(stages.contains(&BillingStage::RoughIn));
        assert!(stages.contains(&BillingStage::Final));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creations_get_distinct_numbers() {
        const N: i64 = 8;
        let store = Arc::new(InMemoryStore::new());
        store.yield_on_number_reads(true);
        for id in 1..=N {
            store.insert_proposal(proposal(id, id, &format!("Job {}", id)));
        }
        let r = Arc::new(resolver_with(
            store.clone(),
            Arc::new(RecordingStageTracker::new()),
            SettlementConfig {
                job_number_attempts: N as u32,
                job_number_backoff_ms: 1,
                ..SettlementConfig::default()
            },
        ));

        let tasks: Vec<_> = (1..=N)
            .map(|id| {
                let r = r.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    let p = store.proposal(id).unwrap();
                    let address = format!("{} Oak Ave, Springfield, IL 62704", id * 10);
                    let c = customer(id, Some(address.as_str()));
                    r.resolve_job(&p, &c, &stage_invoice(id as u32)).await
                })
            })
            .collect();

        let mut numbers: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().job().unwrap().job_number.clone())
            .collect();
        numbers.sort();
        numbers.dedup();

        assert_eq!(numbers.len(), N as usize);
        assert!(numbers.iter().all(|n| n.starts_with("JOB-20260315-")));
    }
}
