pub mod auth;
pub mod catalog;
pub mod host;
pub mod listeners;
pub mod origin;
pub mod pending;
pub mod protocol;
pub mod router;
pub mod sdk;
pub mod settings;
pub mod surface;
pub mod transport;
