#![allow(
    clippy::collapsible_else_if,
    clippy::collapsible_if,
    clippy::module_inception,
    clippy::useless_format
)]
#![deny(
    clippy::get_unwrap,
    clippy::panic,
    clippy::print_stdout,
    clippy::unwrap_used,
    clippy::use_debug
)]

pub mod caps;
pub mod cgroup;
pub mod config;
pub mod cred;
pub mod error;
pub mod logger;
pub mod mount;
pub mod net;
pub mod ns;
pub mod task;
pub mod util;
