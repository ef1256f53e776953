pub mod config;
pub mod device;
pub mod enroll;
pub mod error;
pub mod fprintd;
pub mod policy;
