pub mod config;
pub mod downstream;
pub mod error;
pub mod routes;
pub mod state;
