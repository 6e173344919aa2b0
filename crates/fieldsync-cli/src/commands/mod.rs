pub mod common;
pub mod draft;
pub mod entity;
pub mod sync;
