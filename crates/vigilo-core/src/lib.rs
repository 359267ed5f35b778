pub mod audit_log;
pub mod baseline;
pub mod error;
pub mod history;
pub mod lock;
pub mod paths;
pub mod report;
pub mod settings;
pub mod snapshot;
pub mod store;

pub use error::{Result, VigiloError};
