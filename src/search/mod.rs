pub mod codec;
pub mod engine;
pub mod filter;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use codec::CodecError;
pub use engine::{EngineConfig, EngineError, SearchEngine, SearchStatus, SharedProgressBuffer};
pub use filter::ResultFilter;
pub use store::{MatchRecord, ResultStore};
pub use types::{
    ExactResultItem, FuzzyCondition, FuzzyResultItem, MatchKind, MemoryRange, SearchResultItem,
    ValueType,
};
