//! Real-time text chat relay over TCP.
//!
//! Clients log in under a userid and exchange short text messages that the
//! server broadcasts to every other logged-in client. The wire protocol is one
//! JSON object per line (`{"Action":"MSG","Userid":"alice","Data":"hi"}`).
//!
//! - [`packet`] is the line codec shared by server and client.
//! - [`coordinator`] owns the client registry. It is the single task that
//!   serializes joins, leaves, and message fan-out.
//! - [`connection`] turns one TCP stream into coordinator events.
//! - [`output`] drains one client's bounded outbound queue onto its socket.
//! - [`server`] accepts connections; [`client`] is the terminal client.
//!
//! Slow clients apply backpressure to everyone: the coordinator waits for
//! space in a full outbound queue rather than dropping messages.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod output;
pub mod packet;
pub mod server;

#[cfg(test)]
mod test_support;
