pub mod chat_manager;
pub mod error;
pub mod manager;
pub mod session;

pub use chat_manager::ChatManager;
pub use error::AccountError;
pub use manager::AccountManager;
pub use session::{AccountId, AccountSession, bare_key};
