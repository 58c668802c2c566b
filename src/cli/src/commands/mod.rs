pub mod events;
pub mod modules;
