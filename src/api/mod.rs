pub mod handlers;

pub use handlers::{health_check, invoice_stage, settle_proposal};
