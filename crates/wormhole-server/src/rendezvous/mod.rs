pub mod application;
pub mod mailbox;
pub mod service;
pub mod session;
pub mod ws;

pub use service::{spawn_cleaning, RendezvousService};
