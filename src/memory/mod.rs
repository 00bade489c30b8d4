pub mod fatal;
pub mod ledger;
pub(crate) mod loom_tests;
pub mod page_size;
pub mod region;
pub mod sim;
pub mod stats;
pub mod strategy;
pub mod vm;
