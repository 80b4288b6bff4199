pub mod chat;
pub mod engines;
pub mod segment;
pub mod tags;
