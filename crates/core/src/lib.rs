pub mod actions;
pub mod config;
pub mod connection_machine;
pub mod connections;
pub mod databases;
pub mod editor;
pub mod metadata;
pub mod poller;
pub mod scheme;
pub mod server_info;
pub mod server_probe;
pub mod session;
pub mod settings;
pub mod state;
pub mod store;
pub mod sysinfo;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

