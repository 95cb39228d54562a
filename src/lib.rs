// Treesync - Delta replication of partition forests

pub mod delta;
pub mod ids;
pub mod model;
pub mod processor;
pub mod sync;
