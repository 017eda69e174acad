// deskspace-sync: real-time state sync for shared desktop-shell workspaces.

pub mod backend;
pub mod config;
pub mod engine;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod store;
