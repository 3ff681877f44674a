//! Host platform hooks.
//!
//! The client never talks to OS services directly; the embedding app
//! injects a [`Platform`] so mobile and desktop shells can report network
//! reachability and surface local notifications their own way.

use parley_types::ChatMessage;
use tracing::debug;

/// Services provided by the host application.
pub trait Platform: Send + Sync + 'static {
    /// Whether the device currently has a network route.
    ///
    /// Connection attempts made while this returns `false` fail immediately
    /// and fall into the normal backoff schedule.
    fn is_network_available(&self) -> bool {
        true
    }

    /// Surface a message authored by someone else (e.g. an OS notification).
    fn show_notification(&self, message: &ChatMessage);
}

/// Platform that assumes connectivity and only logs notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlatform;

impl Platform for DefaultPlatform {
    fn show_notification(&self, message: &ChatMessage) {
        debug!(
            conversation = %message.conversation_id,
            sequence = %message.sequence,
            "new message"
        );
    }
}
