pub mod alert;
pub mod cli;
pub mod config;
pub mod dbclient;
pub mod error;
pub mod exit;
pub mod gate;
pub mod remote;
pub mod rotate;
pub mod signal_handler;
pub mod supervise;
pub mod sync;
pub mod types;
pub mod util;
