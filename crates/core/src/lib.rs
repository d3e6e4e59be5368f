pub mod config;
pub mod error;
pub mod logging;

pub use config::{load_dotenv, profile, profiled_env_opt, profiled_env_parse};
pub use error::*;
pub use logging::init_tracing;
