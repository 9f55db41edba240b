pub mod database;
pub mod error;
pub mod history;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod screenshots;
pub mod sessions;
pub mod sink;

pub use database::Database;
pub use error::StoreError;
pub use history::{HistoryReader, SessionHistory};
pub use sink::SqliteSink;
