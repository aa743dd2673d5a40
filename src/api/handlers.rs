use crate::error::SettlementError;
use crate::models::{BillingStage, SettlementResult};
use crate::service::SettlementService;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 结算结果 -> HTTP 状态码
///
/// 前置条件/不存在: 422, 并发冲突: 409, 外部平台或存储失败: 502
pub fn status_for(failure: Option<&SettlementError>) -> StatusCode {
    match failure {
        None => StatusCode::OK,
        Some(e) if e.is_precondition() => StatusCode::UNPROCESSABLE_ENTITY,
        Some(e) if e.is_conflict() => StatusCode::CONFLICT,
        Some(_) => StatusCode::BAD_GATEWAY,
    }
}

fn respond(result: SettlementResult, failure: Option<SettlementError>) -> Response {
    (status_for(failure.as_ref()), Json(result)).into_response()
}

/// 报价单审批通过: 定金开票 + 建单/合并
pub async fn settle_proposal(
    State(service): State<Arc<SettlementService>>,
    Path(proposal_id): Path<i64>,
) -> Response {
    let run = service.run(proposal_id, BillingStage::Deposit).await;
    respond(run.result, run.failure)
}

/// 后续阶段开票 (rough_in / final)
pub async fn invoice_stage(
    State(service): State<Arc<SettlementService>>,
    Path((proposal_id, stage)): Path<(i64, String)>,
) -> Response {
    let stage: BillingStage = match stage.parse() {
        Ok(stage) => stage,
        Err(e) => {
            tracing::warn!(proposal_id, "rejected stage invoice request: {}", e);
            let result = SettlementResult::not_invoiced(e);
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(result)).into_response();
        }
    };
    let run = service.run(proposal_id, stage).await;
    respond(run.result, run.failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::models::BillingStage;

    #[test]
    fn maps_failures_to_status_codes() {
        assert_eq!(status_for(None), StatusCode::OK);
        assert_eq!(
            status_for(Some(&SettlementError::MissingAddress { customer_id: 1 })),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(Some(&SettlementError::ProposalNotFound(7))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(Some(&SettlementError::StageInFlight {
                proposal_id: 7,
                stage: BillingStage::Deposit,
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(Some(&SettlementError::InvoiceCreation(BillingError::Timeout {
                operation: "create_invoice".to_string(),
            }))),
            StatusCode::BAD_GATEWAY
        );
    }
}
