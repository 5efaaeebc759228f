pub mod control;
pub mod handlers;
pub mod middleware;
pub mod relay;
pub mod routes;
pub mod ws;

pub use routes::create_router;
