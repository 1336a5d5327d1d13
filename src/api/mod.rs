pub mod ledger_api;

pub use ledger_api::{ledger_router, public_router, AppState};
