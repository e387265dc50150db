//! Host-side collaborators of the guest agent.
//!
//! - [`guest`]: the host end of the control channel.
//! - [`messages`]: resolves a program message and its latest amends before
//!   a VM is configured from it.

pub mod guest;
pub mod messages;

pub use guest::GuestClient;
pub use messages::{load_updated_message, HttpMessageStore, MessageStore, ProgramMessage, ResolveError};
