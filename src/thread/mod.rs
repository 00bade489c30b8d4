pub(crate) mod backend;
pub mod guard;
pub mod handle;
pub mod manager;
pub mod stack;
