//! Network side of the replication slave.
//!
//! # Components
//!
//! - `NonBlockingChannel`: the byte channel a receiver is bound to
//! - `ReplicationStreamReceiver`: readiness-driven frame decoder and applier
//!
//! The receiver never blocks and never waits. The reactor calls
//! `handle_io` whenever the socket is ready and waits for whatever
//! `IoInterest` comes back.

pub use channel::NonBlockingChannel;
pub use receiver::{IoInterest, ReplicationStreamReceiver};

mod channel;
mod receiver;
