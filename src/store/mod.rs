pub mod file_store;
pub mod project_store;
pub mod transfer_store;
pub mod tx;
pub mod user_store;

pub use file_store::{DirListEntry, FileStore};
pub use project_store::ProjectStore;
pub use transfer_store::TransferStore;
pub use tx::with_tx_retry;
pub use user_store::UserStore;
