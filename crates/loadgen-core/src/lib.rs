pub mod action;
pub mod choice;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod reporter;
pub mod routes;
pub mod scheduler;
pub mod sqlite_store;
pub mod stats;
pub mod status;
pub mod store;

pub use action::*;
pub use choice::*;
pub use config::*;
pub use coordinator::*;
pub use entity::*;
pub use reporter::*;
pub use routes::*;
pub use scheduler::*;
pub use sqlite_store::*;
pub use stats::*;
pub use status::*;
pub use store::*;
