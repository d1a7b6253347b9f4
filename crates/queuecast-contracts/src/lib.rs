pub mod admission;
pub mod catalog;
pub mod chat;
pub mod events;
pub mod history;
pub mod jobs;
pub mod state;
pub mod surface;
