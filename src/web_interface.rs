//! HTTP API: execution endpoints, history, terminal websocket and health.
pub mod routes;
pub mod terminal_socket;
pub mod types;
pub mod web_server;

pub use routes::api;
pub use web_server::WebServer;
