//! Session management: lifecycle state, output log, registry, process driver.

pub mod driver;
pub mod log_store;
#[cfg(test)]
pub mod mock;
pub mod pty;
pub mod registry;
pub mod state;

pub use driver::{
    event_channel, DriverEvent, EventSender, ExitStatus, OutputStream, ProcessDriver, SessionEvent,
};
pub use log_store::{LogStore, DEFAULT_PAGE_LIMIT};
pub use pty::{PtyDriver, PtyOptions};
pub use registry::SessionRegistry;
pub use state::{Session, Transition};
