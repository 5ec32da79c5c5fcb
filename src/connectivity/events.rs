use tokio::sync::mpsc;

/// Link status reported by the platform.
///
/// The platform's opinion is not trusted on its own: an `Up` is always verified
/// with a probe before the monitor goes online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
  Up,
  Down,
}

/// Sending half used by whatever observes the network interface
#[derive(Debug, Clone)]
pub struct LinkSender {
  tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkSender {
  /// Report a link change. Returns false once the monitor has stopped.
  pub fn send(&self, event: LinkEvent) -> bool {
    self.tx.send(event).is_ok()
  }
}

/// Receiving half consumed by the monitor loop
#[derive(Debug)]
pub struct LinkEvents {
  rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl LinkEvents {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<LinkEvent> {
    self.rx.recv().await
  }
}

pub fn link_channel() -> (LinkSender, LinkEvents) {
  let (tx, rx) = mpsc::unbounded_channel();
  (LinkSender { tx }, LinkEvents { rx })
}
