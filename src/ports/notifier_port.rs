//! Alert notification channel port.

use crate::domain::error::QcwatchError;
use crate::domain::notification::Notification;

pub trait NotifierPort: Send + Sync {
    /// Deliver one notification; an error marks the delivery as failed.
    fn send(&self, notification: &Notification) -> Result<(), QcwatchError>;

    /// Short channel name used in delivery records, e.g. `log` or `webhook`.
    fn channel_name(&self) -> &str;
}
