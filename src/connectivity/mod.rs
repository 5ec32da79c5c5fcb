//! Connectivity monitoring: platform link events verified by an active probe.

mod events;
mod monitor;
mod probe;

pub use events::{link_channel, LinkEvent, LinkEvents, LinkSender};
pub use monitor::{format_downtime, ConnectivityMonitor, ConnectivityState};
pub use probe::{HttpProbe, Probe};

#[cfg(test)]
pub(crate) use monitor::tests::ScriptedProbe;
