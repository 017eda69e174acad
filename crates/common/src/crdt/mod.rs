pub mod flatmap;
pub mod origin;
