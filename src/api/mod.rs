pub mod relay_websocket;
pub mod routes;

pub use routes::routes;
