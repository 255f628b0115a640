pub mod api;
pub mod auth;
pub mod deploy;
pub mod source;
pub mod store;
