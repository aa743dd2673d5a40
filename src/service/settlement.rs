use std::sync::Arc;

use crate::config::SettlementConfig;
use crate::db::SettlementStore;
use crate::error::{Result, SettlementError};
use crate::models::{
    BillingStage, Customer, Proposal, SettlementResult, StageInvoice, Tier, TierMode,
};
use crate::service::billing::{BillingPlatform, CounterpartyResolver};
use crate::service::invoice_composer::StageInvoiceComposer;
use crate::service::job_resolver::JobResolver;
use crate::service::stage_tracker::JobStageTracker;
use crate::service::tax::TaxResolver;

/// 一次结算的完整结果: 对外结果以及失败原因 (HTTP 层据此选择状态码)
#[derive(Debug)]
pub struct SettlementRun {
    pub result: SettlementResult,
    pub failure: Option<SettlementError>,
}

/// 开票前已完成的步骤
struct Invoiced {
    proposal: Proposal,
    customer: Customer,
    invoice: StageInvoice,
}

/// 审批结算编排: 校验地址 -> 计费平台客户 -> 阶段发票 -> 工单
pub struct SettlementService {
    store: Arc<dyn SettlementStore>,
    counterparty: CounterpartyResolver,
    composer: StageInvoiceComposer,
    jobs: JobResolver,
    config: SettlementConfig,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        platform: Arc<dyn BillingPlatform>,
        tax: Arc<dyn TaxResolver>,
        tracker: Arc<dyn JobStageTracker>,
        config: SettlementConfig,
    ) -> Self {
        let timeout = config.capability_timeout();
        Self {
            counterparty: CounterpartyResolver::new(platform.clone(), timeout),
            composer: StageInvoiceComposer::new(
                store.clone(),
                platform,
                tax,
                timeout,
                config.stage_claim_lease(),
            ),
            jobs: JobResolver::new(store.clone(), tracker, config.clone()),
            store,
            config,
        }
    }

    /// 审批通过后的定金结算
    pub async fn settle(&self, proposal_id: i64) -> SettlementResult {
        self.run(proposal_id, BillingStage::Deposit).await.result
    }

    /// 后续阶段 (rough-in / final) 开票
    pub async fn invoice_stage(&self, proposal_id: i64, stage: BillingStage) -> SettlementResult {
        self.run(proposal_id, stage).await.result
    }

    /// 执行结算, 任何失败都转换为结构化结果, 不向外抛出
    pub async fn run(&self, proposal_id: i64, stage: BillingStage) -> SettlementRun {
        tracing::info!(proposal_id, stage = %stage, "========== Settlement started ==========");

        let invoiced = match self.invoice(proposal_id, stage).await {
            Ok(invoiced) => invoiced,
            Err(e) => {
                tracing::error!(proposal_id, stage = %stage, "✗ Settlement not invoiced: {}", e);
                return SettlementRun {
                    result: SettlementResult::not_invoiced(e.to_string()),
                    failure: Some(e),
                };
            }
        };

        match self
            .jobs
            .resolve_job(&invoiced.proposal, &invoiced.customer, &invoiced.invoice)
            .await
        {
            Ok(resolution) => {
                let result = SettlementResult::settled(&invoiced.invoice, &resolution);
                tracing::info!(
                    proposal_id,
                    invoice_id = %invoiced.invoice.external_invoice_id,
                    job_id = ?result.job_id,
                    merged = resolution.merged(),
                    "========== Settlement complete =========="
                );
                SettlementRun {
                    result,
                    failure: None,
                }
            }
            Err(e) => {
                tracing::error!(
                    proposal_id,
                    invoice_id = %invoiced.invoice.external_invoice_id,
                    "✗ Invoiced but job resolution failed: {}",
                    e
                );
                SettlementRun {
                    result: SettlementResult::job_pending(&invoiced.invoice, e.to_string()),
                    failure: Some(e),
                }
            }
        }
    }

    async fn invoice(&self, proposal_id: i64, stage: BillingStage) -> Result<Invoiced> {
        let proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or(SettlementError::ProposalNotFound(proposal_id))?;
        let mut customer = self.load_customer(proposal.customer_id).await?;

        // 前置条件全部在调用外部平台之前检查
        if customer.service_address().is_none() {
            return Err(SettlementError::MissingAddress {
                customer_id: customer.id,
            });
        }
        let tiers = self.store.list_tiers(proposal.id).await?;
        let selected_tier = selected_tier(&proposal, &tiers)?;

        if proposal.billing(stage).invoice_id.is_none() {
            let resolution = self
                .counterparty
                .resolve_or_create(&customer)
                .await
                .map_err(SettlementError::Counterparty)?;
            if resolution.changed {
                self.store.save_customer_billing(&resolution.customer).await?;
                tracing::info!(
                    customer_id = customer.id,
                    "Customer billing fields synced from billing platform"
                );
            }
            // 税务辖区必须基于同步后的地址
            customer = self.load_customer(customer.id).await?;
        }

        let fraction = self.config.stage_fraction(stage);
        let invoice = self
            .composer
            .compose(&proposal, &customer, selected_tier, stage, &fraction)
            .await?;

        Ok(Invoiced {
            proposal,
            customer,
            invoice,
        })
    }

    async fn load_customer(&self, customer_id: i64) -> Result<Customer> {
        self.store
            .get_customer(customer_id)
            .await?
            .ok_or(SettlementError::CustomerNotFound(customer_id))
    }
}

/// 选中的档位: 以档位上的 is_selected 为准, 其次是报价单上的 selected_tier_id
fn selected_tier<'a>(proposal: &Proposal, tiers: &'a [Tier]) -> Result<Option<&'a Tier>> {
    if proposal.tier_mode == TierMode::Single {
        return Ok(None);
    }
    tiers
        .iter()
        .find(|t| t.is_selected)
        .or_else(|| {
            proposal
                .selected_tier_id
                .and_then(|id| tiers.iter().find(|t| t.id == id))
        })
        .map(Some)
        .ok_or(SettlementError::NoSelectedTier {
            proposal_id: proposal.id,
        })
}
