pub mod connection;
pub mod events;
pub mod fanout;
pub mod router;
pub mod server;
