pub mod commands;
pub mod common;
