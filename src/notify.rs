//! User-facing notifications about mutation outcomes.

use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
  Success,
  Error,
}

impl fmt::Display for NotificationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Success => f.write_str("success"),
      Self::Error => f.write_str("error"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub kind: NotificationKind,
  pub message: String,
}

/// Fire-and-forget notification sink. Must not block.
pub trait NotificationSink: Send + Sync {
  fn notify(&self, kind: NotificationKind, message: String);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
  fn notify(&self, kind: NotificationKind, message: String) {
    match kind {
      NotificationKind::Success => tracing::info!(%message, "notification"),
      NotificationKind::Error => tracing::error!(%message, "notification"),
    }
  }
}

/// Forwards notifications to a channel for a frontend to display.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl NotificationSink for ChannelNotifier {
  fn notify(&self, kind: NotificationKind, message: String) {
    // Nobody listening is fine
    let _ = self.tx.send(Notification { kind, message });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_channel_notifier_delivers_in_order() {
    let (notifier, mut rx) = ChannelNotifier::new();
    notifier.notify(NotificationKind::Success, "Create trip succeeded".into());
    notifier.notify(NotificationKind::Error, "Failed to delete van".into());

    assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Success);
    assert_eq!(
      rx.recv().await.unwrap(),
      Notification {
        kind: NotificationKind::Error,
        message: "Failed to delete van".into(),
      }
    );
  }

  #[test]
  fn test_channel_notifier_without_receiver() {
    let (notifier, rx) = ChannelNotifier::new();
    drop(rx);
    notifier.notify(NotificationKind::Error, "dropped".into());
  }
}
