//! Application-facing services.
//!
//! [`Mailbox`] is where local mutations enter the system, and [`MailSync`]
//! wires every component together for one signed-in account.

mod mailbox;
mod sync;

pub use mailbox::Mailbox;
pub use sync::{Collaborators, MailSync};
