pub mod http;
pub mod keyring;
