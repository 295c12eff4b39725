pub mod connection;
pub mod websocket;

pub use connection::ConnectionConfig;
pub use websocket::StreamingHandler;
