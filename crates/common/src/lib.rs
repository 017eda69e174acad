// deskspace-common: shared types and pure sync helpers for the deskspace workspace

pub mod crdt;
pub mod merge;
pub mod types;
