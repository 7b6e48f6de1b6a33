//! User-visible status strings and the application notifier callback.

/// Invoked by the manager task after any status change. Must not call
/// back into the engine on the calling thread -- the manager still holds
/// the management lock when it fires this.
pub trait Notifier: Send {
    fn notify(&self);
}

impl<F: Fn() + Send> Notifier for F {
    fn notify(&self) {
        (self)()
    }
}

/// One queue's current user-visible status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    ResolvingHostName,
    FormingAuxiliaryConnection,
    InteractiveTransfer,
    ImageComplete,
    NotConnected,
    ConnectionClosedUnexpectedly,
    Disconnected,
}

impl Status {
    pub fn message(&self) -> &'static str {
        match self {
            Status::ResolvingHostName => "Resolving host name ...",
            Status::FormingAuxiliaryConnection => "Forming auxiliary connection...",
            Status::InteractiveTransfer => "Interactive transfer...",
            Status::ImageComplete => "Image complete.",
            Status::NotConnected => "Not connected.",
            Status::ConnectionClosedUnexpectedly => "Connection closed unexpectedly.",
            Status::Disconnected => "Disconnected.",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn closure_notifier_fires() {
        let called = Arc::new(AtomicBool::new(false));
        let c = called.clone();
        let notifier: Box<dyn Notifier> = Box::new(move || c.store(true, Ordering::SeqCst));
        notifier.notify();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn status_messages_match_spec_strings() {
        assert_eq!(Status::ImageComplete.message(), "Image complete.");
        assert_eq!(Status::NotConnected.message(), "Not connected.");
    }
}
