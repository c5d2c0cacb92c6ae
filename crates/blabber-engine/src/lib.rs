pub mod cache;
pub mod engine;
pub mod journal;

pub use engine::{BlockHandle, EngineOptions, TransactionEngine};
pub use journal::{Journal, JOURNAL_HEADER_SIZE};
