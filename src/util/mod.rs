pub mod command;
pub mod output;
pub mod paths;
