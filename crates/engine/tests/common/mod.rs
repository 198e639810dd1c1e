pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{bottle, engine_with, ledger_entry, seeded_payload, test_config};
#[allow(unused_imports)]
pub use mocks::{
    ConflictingStore, RecordingSink, Reply, ScriptedFetcher, StallingPublishStore, StaticCatalog,
};
