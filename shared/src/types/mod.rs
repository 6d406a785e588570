pub mod events;
pub mod target;
