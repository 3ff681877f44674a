//! Offline notification hook.
//!
//! When an operator message reaches a device with no live connection the
//! relay hands it to a [`PushDispatcher`]. Delivery through APNs/FCM is
//! deployment specific; the bundled dispatcher only logs.

use async_trait::async_trait;
use parley_types::{AppId, ChatMessage, DeviceId};

/// Notifies devices that are offline.
#[async_trait]
pub trait PushDispatcher: Send + Sync {
    /// Called once per stored operator message for an offline device.
    async fn notify_offline(&self, app_id: &AppId, device_id: &DeviceId, message: &ChatMessage);
}

/// Dispatcher that records the notification in the log.
#[derive(Debug, Default, Clone)]
pub struct LogPushDispatcher;

#[async_trait]
impl PushDispatcher for LogPushDispatcher {
    async fn notify_offline(&self, app_id: &AppId, device_id: &DeviceId, message: &ChatMessage) {
        tracing::info!(
            app = %app_id,
            device = %device_id,
            server_id = %message.server_id,
            "device offline, push notification requested"
        );
    }
}
