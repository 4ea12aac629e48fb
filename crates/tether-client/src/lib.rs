// Blocking client for a NATS-compatible messaging broker.
//
// One `Client` owns one TCP/TLS connection and multiplexes subscriptions,
// request/reply, JetStream streams and pull consumers, key-value buckets,
// and micro-service endpoints over it. Progress is cooperative: the
// application drives the socket by calling `process`, or one of the
// fetch/dispatch wrappers that loop over it.
//
// ```no_run
// use tether_client::{Client, ClientOptions, Reply};
// use std::time::Duration;
//
// fn main() -> tether_client::Result<()> {
//     let mut client = Client::connect(ClientOptions::default())?;
//     client.subscribe("greet.*", |_msg| {
//         Ok(Some(Reply::Payload("hello".into())))
//     })?;
//     client.process(Duration::from_secs(1))?;
//     Ok(())
// }
// ```

mod auth;
mod client;
mod config;
mod conn;
mod error;
pub mod jetstream;
mod queue;
pub mod service;
mod tls;

pub use client::{Client, Handler, Reply};
pub use config::{ClientOptions, DelayMode};
pub use conn::Connection;
pub use error::{Error, Result};
pub use queue::Queue;
pub use service::{EndpointStats, Service};

// The wire types clients handle directly.
pub use tether_wire::{ClientOp, HeaderMap, Message, Payload, ServerInfo};
