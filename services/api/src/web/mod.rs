pub mod middleware;
pub mod rest;
pub mod state;

pub use middleware::identify;
pub use rest::{api_routes, ApiDoc};
