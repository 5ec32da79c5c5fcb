//! User-facing notifications.

use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
  pub kind: ToastKind,
  pub title: String,
  pub message: Option<String>,
}

impl Toast {
  pub fn success(title: impl Into<String>) -> Self {
    Self {
      kind: ToastKind::Success,
      title: title.into(),
      message: None,
    }
  }

  pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind: ToastKind::Error,
      title: title.into(),
      message: Some(message.into()),
    }
  }
}

/// Shows toasts to the user.
pub trait Notifier: Send + Sync {
  fn notify(&self, toast: Toast);
}

/// Writes toasts to the log. Used by the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, toast: Toast) {
    let detail = toast.message.as_deref().unwrap_or("");
    match toast.kind {
      ToastKind::Success => info!(title = %toast.title, detail, "toast"),
      ToastKind::Error => warn!(title = %toast.title, detail, "toast"),
    }
  }
}

/// Forwards toasts to a receiver, typically a UI event loop.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  tx: mpsc::UnboundedSender<Toast>,
}

impl ChannelNotifier {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<Toast>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl Notifier for ChannelNotifier {
  fn notify(&self, toast: Toast) {
    // Nobody listening any more
    let _ = self.tx.send(toast);
  }
}
