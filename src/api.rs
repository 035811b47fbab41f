pub mod archive;
pub mod errors;
pub mod items;
pub mod migration;
pub mod queue;
pub mod sources;
