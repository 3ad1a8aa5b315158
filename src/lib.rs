//! Named-variable publish/subscribe over a single UDP socket.
//!
//! A broker process acts as the rendezvous point for a swarm of
//! cooperating processes: each publishes numeric variables by name and
//! receives fan-out for the names it subscribed to, while the broker
//! tracks peer liveness and drops anyone who goes silent. Each module
//! focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for broker and client modes.
//! - [`protocol`] is the fixed little-endian wire format: keep-alive,
//!   subscribe, and publish datagrams plus the tagged value union.
//! - [`peers`] tracks remote endpoints and their TTL-based liveness.
//! - [`store`] holds the named variables, their subscriber sets, and the
//!   local shadow values for in-process consumers.
//! - [`broker`] drives it all from a single non-blocking socket with a
//!   drain-then-sweep tick, and exposes the local
//!   subscribe/read/publish/clear API.
//! - [`client`] is the remote counterpart: ephemeral socket, automatic
//!   keep-alives, and watchable received values.
//!
//! Delivery is best effort: no acknowledgments, no ordering across
//! variables, no authentication. Intended for a single host or a trusted
//! LAN.

pub mod broker;
pub mod cli;
pub mod client;
pub mod peers;
pub mod protocol;
pub mod store;
