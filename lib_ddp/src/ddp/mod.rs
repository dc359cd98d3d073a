//! # DDP Protocol Module
//!
//! Wire-level vocabulary shared by the transport and the core: the client and
//! server message enums and the `Document` alias used for field maps.

/// Client and server message types with their JSON encoding.
pub mod message;

pub use message::{ClientMessage, Document, ServerMessage};
