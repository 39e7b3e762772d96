pub mod cli;
pub mod error;
pub mod events;
pub mod routes;
pub mod security;
pub mod server;
pub mod state;
