//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed because it's needed by the port crates and by the
//! static initializers they generate.
mod init;

pub use self::init::Init;
