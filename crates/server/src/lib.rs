pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod services;
pub mod state;

#[cfg(test)]
mod routes_tests;

pub use state::AppState;
