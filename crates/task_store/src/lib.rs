mod error;
mod schema;
mod store;

pub use error::StoreError;
pub use schema::{Message, MessageForm, MessageStatus, Role, Task, TaskState};
pub use store::{StoreSnapshot, TaskStore};
