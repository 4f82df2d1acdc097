pub mod cache;
pub mod core;
pub mod grades;
pub mod roster;
