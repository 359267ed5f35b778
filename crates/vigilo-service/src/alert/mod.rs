//! Alert delivery: report formatting, notifier channels and the dispatcher
//! that applies retry, timeout and log fallback.

pub mod dispatcher;
pub mod format;
pub mod notifiers;

use async_trait::async_trait;
use vigilo_core::baseline::AlertMode;
use vigilo_core::error::Result;
use vigilo_core::report::AlertReport;

pub use dispatcher::{Dispatcher, RetryPolicy};

/// One delivery channel. `send` reports failure as
/// `VigiloError::ChannelUnavailable`; timeouts are imposed by the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn mode(&self) -> AlertMode;

    async fn send(&self, report: &AlertReport) -> Result<()>;
}
