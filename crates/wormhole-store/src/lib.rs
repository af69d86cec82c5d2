pub mod database;
pub mod mailboxes;
pub mod messages;
pub mod models;
pub mod nameplates;
pub mod schema;

mod error;

pub use database::Store;
pub use error::StoreError;
pub use models::*;

pub type Result<T> = std::result::Result<T, StoreError>;
