pub mod customer;
pub mod invoice;
pub mod job;
pub mod proposal;
pub mod result;

pub use customer::Customer;
pub use invoice::{Invoice, NewInvoice, StageLineItem, TaxBreakdown};
pub use job::{InvoiceLink, Job, JobRow, JobStatus, NewJob};
pub use proposal::{
    BillingStage, Proposal, ProposalLineItem, ProposalRow, StageBilling, StageStatus, Tier,
    TierMode,
};
pub use result::{JobResolution, SettlementOutcome, SettlementResult, StageInvoice};
