pub mod authority;
pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod messages;
