//! Starting init candidates and reaping children.
pub mod command;
pub mod fork;
pub mod reap;

pub use command::{run_commands, InitCommand};
pub use reap::wait_orphans;
