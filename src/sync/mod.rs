//! Client side of the relay: wire protocol, transports, host seam and the
//! adaptive poll loop.

pub mod client;
pub mod host;
pub mod protocol;
pub mod schedule;
pub mod transport;

pub use client::{Broadcaster, ClientContext, ClientState, PollClient, PollHandle, PollOutcome};
pub use host::{HostAdapter, RecordingHost};
pub use schedule::PollSchedule;
pub use transport::{HttpTransport, LocalTransport, RelayTransport};
