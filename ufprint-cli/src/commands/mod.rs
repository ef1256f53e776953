pub mod delete;
pub mod devices;
pub mod enroll;
pub mod helper;
pub mod policy;
