mod display;
mod load;
mod types;

pub use display::display_config;
pub use load::{load_config, validate_configs, ConfigError};
pub use types::{Config, RouteConfig, ServerConfig, ThrottleRule};
