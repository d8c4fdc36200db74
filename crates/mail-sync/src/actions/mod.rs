//! Email actions module
//!
//! Provides action handlers for local flag changes like read/unread and
//! star, which sync must not undo before the server has seen them.

mod handler;

pub use handler::ActionHandler;
