pub mod config;
pub mod credentials;
pub mod daemon;
pub mod generate;
pub mod identity;
pub mod locks;
pub mod mail;
pub mod notify;
pub mod pipeline;
pub mod publish;
pub mod store;
pub mod sync;

pub use config::Config;
pub use identity::{CorrelationKey, MessageKey};
pub use store::{MessageStatus, RecordStore};
