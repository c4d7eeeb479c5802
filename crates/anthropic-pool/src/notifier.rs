//! Toast/notification channel
//!
//! The host application owns the actual notification surface (terminal
//! toast, desktop notification, whatever); the pool only needs to emit
//! typed events through this trait. Grounded on the teacher's pattern of
//! keeping external collaborators behind a narrow trait object (see
//! `provider_impl.rs`'s `Provider` trait) rather than reaching for a
//! concrete channel type.

use std::sync::Arc;

/// Severity of a toast emitted by the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

/// A debounce/dedup key so the host can coalesce repeated toasts (e.g. the
/// `account-switch` key used on every account-specific failover).
pub type ToastKey = &'static str;

pub trait Notifier: Send + Sync {
    /// Emit a toast. Implementations must swallow their own failures — per
    /// the error handling design, a broken notification channel must never
    /// propagate back into the request path.
    fn notify(&self, level: ToastLevel, key: Option<ToastKey>, message: &str);
}

/// A [`Notifier`] that discards every call. Used where no host notification
/// channel is wired (tests, headless invocations).
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _level: ToastLevel, _key: Option<ToastKey>, _message: &str) {}
}

pub type SharedNotifier = Arc<dyn Notifier>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_notifier_never_panics() {
        let notifier = NullNotifier;
        notifier.notify(ToastLevel::Info, Some("account-switch"), "hello");
        notifier.notify(ToastLevel::Error, None, "boom");
    }
}
