pub mod checkins;
pub mod classes;
pub mod core;
pub mod roster;
pub mod summary;
