//! Repository handles scoped to a team, pipeline or build.

pub mod build;
pub mod ledger;
pub mod pipeline;
pub mod team;

pub use build::{BuildDb, BuildRow};
pub use ledger::{LedgerInput, LedgerOutput, PgResourceLedger, ResourceLedger};
pub use pipeline::PipelineDb;
pub use team::{PipelineRow, TeamDb};
