//! Wire format shared by the gateway and its clients.
//!
//! Every server → client frame is an [`Envelope`]; every client → server
//! frame is a [`ClientMessage`] naming one of the control events in
//! [`events`].

pub mod control;
pub mod envelope;
pub mod events;

pub use control::{CadenceBounds, ClientMessage, ClientRequest, IntervalAck};
pub use envelope::{Envelope, Status};
