pub mod handlers;
pub mod models;
pub mod routes;

pub use routes::{notification_routes, routes};
