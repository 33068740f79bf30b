pub mod communities;
pub mod database;
pub mod error;
pub mod history;
pub mod schema;
pub mod users;

pub use communities::{CommunityRepo, CommunityRow};
pub use database::Database;
pub use error::StoreError;
pub use history::{HistoryRepo, RangeOrder};
pub use users::{UserRepo, UserRow};
