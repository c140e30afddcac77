//! HTTP surface: routes, client identification and the server loop.

mod gate;
mod routes;
mod server;

pub use gate::{Admission, Caller, RequestGate};
pub use routes::router;
pub use server::HttpServer;
