// dbguardian/src/restore/mod.rs
pub mod db_restore;
mod logic;
pub mod verification;

pub use db_restore::{PgRestore, RestoreTool};
pub(crate) use logic::perform_restore;
