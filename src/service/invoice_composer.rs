use bigdecimal::{BigDecimal, Zero};
use std::sync::Arc;
use std::time::Duration;

use crate::db::SettlementStore;
use crate::error::{Result, SettlementError, StoreError};
use crate::models::{
    BillingStage, Customer, NewInvoice, Proposal, ProposalLineItem, StageInvoice, StageLineItem,
    StageStatus, Tier, TierMode,
};
use crate::service::billing::{with_timeout, BillingPlatform, CreateInvoiceRequest};
use crate::service::tax::{PostalAddress, TaxResolver};

/// 选出参与开票的明细: 多档位时只取选中档位, 且排除未勾选的附加项
pub fn select_items<'a>(
    proposal: &Proposal,
    selected_tier: Option<&Tier>,
    items: &'a [ProposalLineItem],
) -> Result<Vec<&'a ProposalLineItem>> {
    let tier_id = match proposal.tier_mode {
        TierMode::Single => None,
        TierMode::Multi => Some(
            selected_tier
                .map(|t| t.id)
                .ok_or(SettlementError::NoSelectedTier {
                    proposal_id: proposal.id,
                })?,
        ),
    };

    Ok(items
        .iter()
        .filter(|item| item.proposal_id == proposal.id)
        .filter(|item| tier_id.is_none() || item.tier_id == tier_id)
        .filter(|item| item.is_included())
        .collect())
}

/// 按阶段比例缩放数量与金额 (快照, 不修改原明细)
pub fn prorate(items: &[&ProposalLineItem], fraction: &BigDecimal) -> Vec<StageLineItem> {
    items
        .iter()
        .map(|item| StageLineItem {
            source_item_id: item.id,
            description: item.description.clone(),
            unit_price: item.unit_price.clone(),
            quantity: &item.quantity * fraction,
            total: &item.total * fraction,
        })
        .collect()
}

pub fn stage_subtotal(items: &[StageLineItem]) -> BigDecimal {
    items
        .iter()
        .fold(BigDecimal::zero(), |acc, item| acc + &item.total)
        .round(2)
        .with_scale(2)
}

/// 阶段发票生成器
pub struct StageInvoiceComposer {
    store: Arc<dyn SettlementStore>,
    platform: Arc<dyn BillingPlatform>,
    tax: Arc<dyn TaxResolver>,
    timeout: Duration,
    claim_lease: Duration,
}

impl StageInvoiceComposer {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        platform: Arc<dyn BillingPlatform>,
        tax: Arc<dyn TaxResolver>,
        timeout: Duration,
        claim_lease: Duration,
    ) -> Self {
        Self {
            store,
            platform,
            tax,
            timeout,
            claim_lease,
        }
    }

    /// 生成阶段发票
    ///
    /// 报价单上已有该阶段的发票号时直接返回, 不再调用计费平台.
    /// 调用平台前先认领该阶段, 并发的重复请求得到 `StageInFlight`.
    /// `customer` 必须是计费平台同步之后重新读取的记录.
    pub async fn compose(
        &self,
        proposal: &Proposal,
        customer: &Customer,
        selected_tier: Option<&Tier>,
        stage: BillingStage,
        fraction: &BigDecimal,
    ) -> Result<StageInvoice> {
        if let Some(existing) = existing_invoice(proposal, stage, fraction)? {
            return Ok(existing);
        }

        let address = customer
            .service_address()
            .ok_or(SettlementError::MissingAddress {
                customer_id: customer.id,
            })?;
        let external_customer_id = customer.billing_external_id.clone().ok_or_else(|| {
            SettlementError::Counterparty(crate::error::BillingError::Rejected {
                operation: "compose".to_string(),
                message: format!("customer {} has no billing counterparty", customer.id),
            })
        })?;

        let items = self.store.list_proposal_items(proposal.id).await?;
        let selected = select_items(proposal, selected_tier, &items)?;
        let stage_items = prorate(&selected, fraction);
        let subtotal = stage_subtotal(&stage_items);

        let tax = self.tax.resolve(&subtotal, &PostalAddress::parse(address))?;

        tracing::info!(
            proposal_id = proposal.id,
            stage = %stage,
            items = stage_items.len(),
            subtotal = %subtotal,
            tax = %tax.total_tax_amount,
            county = %tax.county,
            "Composing stage invoice"
        );

        let request = CreateInvoiceRequest {
            customer_external_id: external_customer_id,
            reference_number: proposal.reference_number(stage),
            stage,
            items: stage_items,
            tax: tax.clone(),
        };

        if !self
            .store
            .claim_stage(proposal.id, stage, self.claim_lease)
            .await?
        {
            let current = self
                .store
                .get_proposal(proposal.id)
                .await?
                .ok_or(SettlementError::ProposalNotFound(proposal.id))?;
            if let Some(existing) = existing_invoice(&current, stage, fraction)? {
                return Ok(existing);
            }
            tracing::warn!(
                proposal_id = proposal.id,
                stage = %stage,
                "Stage invoice already in flight, not calling billing platform"
            );
            return Err(SettlementError::StageInFlight {
                proposal_id: proposal.id,
                stage,
            });
        }
        let created = match with_timeout(
            self.timeout,
            "create_invoice",
            self.platform.create_invoice(request),
        )
        .await
        {
            Ok(created) => created,
            Err(e) => {
                let note = format!("{} invoice creation failed: {}", stage.label(), e);
                tracing::error!(proposal_id = proposal.id, "✗ {}", note);
                if let Err(mark_err) = self
                    .store
                    .record_stage_failed(proposal.id, stage, &note)
                    .await
                {
                    tracing::error!(
                        proposal_id = proposal.id,
                        "failed to mark stage {} as {}: {}",
                        stage,
                        StageStatus::Failed.as_str(),
                        mark_err
                    );
                }
                return Err(SettlementError::InvoiceCreation(e));
            }
        };

        let local = NewInvoice {
            customer_id: customer.id,
            proposal_id: proposal.id,
            stage: stage.label().to_string(),
            subtotal: subtotal.clone(),
            state_tax_amount: tax.state_tax_amount.clone(),
            county_tax_amount: tax.county_tax_amount.clone(),
            county: tax.county.clone(),
            total: tax.total.clone(),
            external_id: created.external_invoice_id.clone(),
            status: StageStatus::Sent.as_str().to_string(),
        };
        // 平台发票已创建: 本地写入失败时不能重试平台调用
        let invoice = self
            .store
            .record_stage_invoice(&local, stage, &created.customer_facing_url)
            .await
            .map_err(|e| {
                tracing::error!(
                    proposal_id = proposal.id,
                    external_invoice_id = %created.external_invoice_id,
                    "Invoice created on billing platform but local record failed: {}",
                    e
                );
                e
            })?;

        tracing::info!(
            proposal_id = proposal.id,
            invoice_id = invoice.id,
            external_invoice_id = %created.external_invoice_id,
            "✓ Stage invoice created"
        );

        Ok(StageInvoice {
            stage,
            stage_fraction: fraction.clone(),
            external_invoice_id: created.external_invoice_id,
            invoice_link: created.customer_facing_url,
            local_invoice_id: Some(invoice.id),
            subtotal: Some(subtotal),
            total: Some(tax.total),
            reused: false,
        })
    }
}

/// 已开票阶段的复用结果; 有发票号却没有链接视为数据损坏
fn existing_invoice(
    proposal: &Proposal,
    stage: BillingStage,
    fraction: &BigDecimal,
) -> Result<Option<StageInvoice>> {
    let billing = proposal.billing(stage);
    let Some(invoice_id) = &billing.invoice_id else {
        return Ok(None);
    };
    let link = billing
        .invoice_link
        .as_deref()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| {
            StoreError::Corrupt(format!(
                "proposal {} has {} invoice {} without a link",
                proposal.id, stage, invoice_id
            ))
        })?;

    tracing::info!(
        proposal_id = proposal.id,
        stage = %stage,
        invoice_id = %invoice_id,
        "Stage already invoiced, reusing existing invoice"
    );
    Ok(Some(StageInvoice {
        stage,
        stage_fraction: fraction.clone(),
        external_invoice_id: invoice_id.clone(),
        invoice_link: link.to_string(),
        local_invoice_id: None,
        subtotal: None,
        total: None,
        reused: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        customer, item, proposal, tax_resolver, InMemoryStore, MockBillingPlatform,
    };
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn tier(id: i64, proposal_id: i64, level: i16, selected: bool) -> Tier {
        Tier {
            id,
            proposal_id,
            level,
            name: format!("Tier {}", level),
            is_selected: selected,
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        platform: Arc<MockBillingPlatform>,
        composer: StageInvoiceComposer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let platform = Arc::new(MockBillingPlatform::new());
        let composer = StageInvoiceComposer::new(
            store.clone(),
            platform.clone(),
            Arc::new(tax_resolver()),
            Duration::from_secs(1),
            Duration::from_secs(300),
        );
        Fixture {
            store,
            platform,
            composer,
        }
    }

    fn linked_customer(address: Option<&str>) -> Customer {
        let mut c = customer(1, address);
        c.billing_external_id = Some("cus_1".to_string());
        c
    }

    #[test]
    fn excludes_unselected_addons() {
        let p = proposal(1, 1, "Service upgrade");
        let items = vec![
            item(1, 1, None, "100", "2", false, false),
            item(2, 1, None, "50", "1", true, true),
            item(3, 1, None, "75", "1", true, false),
        ];
        let selected = select_items(&p, None, &items).unwrap();
        let ids: Vec<i64> = selected.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let stage = prorate(&selected, &dec("0.5"));
        assert_eq!(stage[0].total, dec("100"));
        assert_eq!(stage[0].quantity, dec("1"));
        assert_eq!(stage_subtotal(&stage), dec("125.00"));
    }

    #[test]
    fn multi_tier_uses_only_selected_tier_items() {
        for tier_count in 1..=3i64 {
            let mut p = proposal(1, 1, "Generator install");
            p.tier_mode = TierMode::Multi;
            let tiers: Vec<Tier> = (1..=tier_count)
                .map(|l| tier(10 + l, 1, l as i16, l == tier_count))
                .collect();
            let items: Vec<ProposalLineItem> = tiers
                .iter()
                .enumerate()
                .map(|(n, t)| item(n as i64 + 1, 1, Some(t.id), "1000", "1", false, false))
                .collect();
            let selected_tier = tiers.iter().find(|t| t.is_selected);

            let selected = select_items(&p, selected_tier, &items).unwrap();
            assert_eq!(selected.len(), 1);
            assert_eq!(selected[0].tier_id, Some(10 + tier_count));
        }
    }

    #[test]
    fn multi_tier_without_selection_is_rejected() {
        let mut p = proposal(1, 1, "Generator install");
        p.tier_mode = TierMode::Multi;
        let err = select_items(&p, None, &[]).unwrap_err();
        assert!(matches!(err, SettlementError::NoSelectedTier { .. }));
    }

    #[test]
    fn deposit_item_total_is_half_of_price_times_quantity() {
        let p = proposal(1, 1, "Rewire");
        let cases = [("19.99", "3"), ("1250.00", "1"), ("0.40", "7"), ("333.33", "2")];
        for (n, (price, qty)) in cases.iter().enumerate() {
            let items = vec![item(n as i64, 1, None, price, qty, false, false)];
            let selected = select_items(&p, None, &items).unwrap();
            let stage = prorate(&selected, &dec("0.5"));
            assert_eq!(stage[0].total, dec(price) * dec(qty) * dec("0.5"));
        }
    }

    #[tokio::test]
    async fn deposit_scenario_computes_tax_split() {
        let f = fixture();
        let p = proposal(1, 1, "Panel replacement");
        f.store.insert_proposal(p.clone());
        f.store
            .insert_items(vec![item(1, 1, None, "1000", "1", false, false)]);
        let c = linked_customer(Some("123 Main St, Springfield, IL 62704"));
        f.store.insert_customer(c.clone());

        let result = f
            .composer
            .compose(&p, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap();

        assert_eq!(result.subtotal, Some(dec("500.00")));
        assert_eq!(result.total, Some(dec("535.00")));

        let requests = f.platform.invoice_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].reference_number, "P1001-DEP");
        assert_eq!(requests[0].tax.state_tax_amount, dec("23.75"));
        assert_eq!(requests[0].tax.county_tax_amount, dec("11.25"));
        assert_eq!(requests[0].tax.total_tax_amount, dec("35.00"));

        let invoices = f.store.invoices();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].county, "Sangamon County");

        let stored = f.store.proposal(1).unwrap();
        assert_eq!(stored.deposit.status, Some(StageStatus::Sent));
        assert_eq!(
            stored.deposit.invoice_id.as_deref(),
            Some(result.external_invoice_id.as_str())
        );
    }

    #[tokio::test]
    async fn second_compose_reuses_existing_invoice() {
        let f = fixture();
        f.store.insert_proposal(proposal(1, 1, "Panel replacement"));
        f.store
            .insert_items(vec![item(1, 1, None, "1000", "1", false, false)]);
        let c = linked_customer(Some("123 Main St, Springfield, IL 62704"));

        let first_proposal = f.store.proposal(1).unwrap();
        let first = f
            .composer
            .compose(&first_proposal, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap();

        let reloaded = f.store.proposal(1).unwrap();
        let second = f
            .composer
            .compose(&reloaded, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap();

        assert!(second.reused);
        assert_eq!(first.external_invoice_id, second.external_invoice_id);
        assert_eq!(first.invoice_link, second.invoice_link);
        assert_eq!(f.platform.invoice_requests().len(), 1);
        assert_eq!(f.store.invoices().len(), 1);
    }

    #[tokio::test]
    async fn missing_address_fails_before_platform_call() {
        let f = fixture();
        f.store.insert_proposal(proposal(1, 1, "Panel replacement"));
        let c = linked_customer(Some("   "));
        let p = f.store.proposal(1).unwrap();

        let err = f
            .composer
            .compose(&p, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::MissingAddress { .. }));
        assert!(f.platform.invoice_requests().is_empty());
    }

    #[tokio::test]
    async fn platform_failure_marks_stage_failed() {
        let f = fixture();
        f.platform.fail_invoice_calls(true);
        f.store.insert_proposal(proposal(1, 1, "Panel replacement"));
        f.store
            .insert_items(vec![item(1, 1, None, "1000", "1", false, false)]);
        let c = linked_customer(Some("123 Main St, Springfield, IL 62704"));
        let p = f.store.proposal(1).unwrap();

        let err = f
            .composer
            .compose(&p, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::InvoiceCreation(_)));
        let stored = f.store.proposal(1).unwrap();
        assert_eq!(stored.deposit.status, Some(StageStatus::Failed));
        assert!(stored.deposit.invoice_link.is_none());
        assert!(stored.deposit.note.unwrap().contains("Deposit invoice creation failed"));
        assert!(f.store.invoices().is_empty());
    }

    #[tokio::test]
    async fn stored_invoice_without_link_is_corrupt() {
        let f = fixture();
        let mut p = proposal(1, 1, "Panel replacement");
        p.deposit.invoice_id = Some("inv_9".to_string());
        p.deposit.status = Some(StageStatus::Sent);
        f.store.insert_proposal(p.clone());
        let c = linked_customer(Some("123 Main St, Springfield, IL 62704"));

        let err = f
            .composer
            .compose(&p, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::Store(StoreError::Corrupt(_))));
        assert!(f.platform.invoice_requests().is_empty());
    }

    #[tokio::test]
    async fn claimed_stage_is_not_invoiced_twice() {
        let f = fixture();
        f.store.insert_proposal(proposal(1, 1, "Panel replacement"));
        f.store
            .insert_items(vec![item(1, 1, None, "1000", "1", false, false)]);
        let c = linked_customer(Some("123 Main St, Springfield, IL 62704"));
        assert!(f
            .store
            .claim_stage(1, BillingStage::Deposit, Duration::from_secs(300))
            .await
            .unwrap());

        let p = f.store.proposal(1).unwrap();
        let err = f
            .composer
            .compose(&p, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::StageInFlight { proposal_id: 1, .. }));
        assert!(f.platform.invoice_requests().is_empty());
        assert_eq!(f.store.proposal(1).unwrap().deposit.status, Some(StageStatus::Pending));
    }

    #[tokio::test]
    async fn expired_claim_can_be_taken_over() {
        let f = fixture();
        f.store.insert_proposal(proposal(1, 1, "Panel replacement"));
        f.store
            .insert_items(vec![item(1, 1, None, "1000", "1", false, false)]);
        let c = linked_customer(Some("123 Main St, Springfield, IL 62704"));
        f.store
            .claim_stage(1, BillingStage::Deposit, Duration::from_secs(300))
            .await
            .unwrap();
        f.store.expire_stage_claims();

        let p = f.store.proposal(1).unwrap();
        let result = f
            .composer
            .compose(&p, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap();

        assert!(!result.reused);
        assert_eq!(f.platform.invoice_requests().len(), 1);
        assert_eq!(f.store.proposal(1).unwrap().deposit.status, Some(StageStatus::Sent));
    }

    #[tokio::test]
    async fn losing_claim_reuses_invoice_recorded_by_winner() {
        let f = fixture();
        f.store.insert_proposal(proposal(1, 1, "Panel replacement"));
        f.store
            .insert_items(vec![item(1, 1, None, "1000", "1", false, false)]);
        let c = linked_customer(Some("123 Main St, Springfield, IL 62704"));
        let stale = f.store.proposal(1).unwrap();

        let first = f
            .composer
            .compose(&stale, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap();
        // 第二个请求持有的是开票前读取的快照
        let second = f
            .composer
            .compose(&stale, &c, None, BillingStage::Deposit, &dec("0.5"))
            .await
            .unwrap();

        assert!(second.reused);
        assert_eq!(second.external_invoice_id, first.external_invoice_id);
        assert_eq!(second.invoice_link, first.invoice_link);
        assert_eq!(f.platform.invoice_requests().len(), 1);
        assert_eq!(f.store.invoices().len(), 1);
    }
}
