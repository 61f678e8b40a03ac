pub mod caption;
pub mod config;
pub mod error;
pub mod page;
pub mod routes;

pub use caption::Captioner;
pub use config::Config;
pub use routes::{router, AppState};
