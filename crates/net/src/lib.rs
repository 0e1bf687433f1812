//! Commander Network Library
//!
//! Supervised, bidirectional message passing between one server and many
//! clients over TCP.
//!
//! # Architecture
//!
//! - **Server**: accepts clients and tracks each as a session keyed by its client id
//! - **Client**: owns one connection and re-establishes it when the link breaks
//! - **Codec**: length-prefixed frames carrying a subject and a JSON object payload
//! - **Events**: callbacks run off the network path, in emission order
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::new();
//! server.set_interface("*")?;
//! server.set_port(30000)?;
//! server.start().await?;
//!
//! let client = Client::new();
//! client.set_address("127.0.0.1")?;
//! client.set_port(30000)?;
//! client.set_client_id("abc")?;
//! client.subscribe("on_message", |event| {
//!     if let Event::Message { message, .. } = event {
//!         println!("{}: {:?}", message.subject(), message.payload());
//!     }
//! })?;
//! client.connect().await?;
//!
//! server.send(BROADCAST, Message::from_value("echo", json!({"message": "hello"}))?).await?;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod message;
pub mod server;
pub mod state;
mod sync;

pub use client::Client;
pub use config::{ClientConfig, ReconnectPolicy, ServerConfig, ANY_INTERFACE};
pub use dispatch::{Event, EventDispatcher, EventKind};
pub use error::{Error, Result};
pub use message::{Message, Payload};
pub use server::{Server, BROADCAST};
pub use state::{ConnectionState, Flag, Phase, StateTransition};

/// Default port for Commander servers
pub const DEFAULT_PORT: u16 = 30000;
