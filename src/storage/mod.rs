pub mod db;
mod files;
pub mod locks;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use files::RecordScan;
pub use locks::KeyGuard;
pub use tables::*;
