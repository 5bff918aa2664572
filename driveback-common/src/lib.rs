pub mod archiver;
pub mod error;
pub mod node;
pub mod query;
pub mod store;

pub use error::DriveError;
