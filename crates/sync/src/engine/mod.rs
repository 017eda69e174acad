pub mod debounce;
pub mod fast_path;
pub mod policy;
pub mod registry;
pub mod transport;
pub mod ydoc;
