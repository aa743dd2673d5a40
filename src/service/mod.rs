pub mod address;
pub mod billing;
pub mod billing_client;
pub mod invoice_composer;
pub mod job_resolver;
pub mod settlement;
pub mod stage_tracker;
pub mod tax;

pub use address::{match_address, normalize, AddressMatch, CanonicalAddress, Confidence};
pub use billing::{BillingPlatform, CounterpartyResolver};
pub use billing_client::HttpBillingPlatform;
pub use invoice_composer::StageInvoiceComposer;
pub use job_resolver::JobResolver;
pub use settlement::{SettlementRun, SettlementService};
pub use stage_tracker::{JobStageTracker, PgJobStageTracker};
pub use tax::{RateTableTaxResolver, TaxResolver};
