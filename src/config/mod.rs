//! Configuration loading, schema, and validation

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{
    AccessControlConfig, Action, Config, Limits, LogFields, LoggingConfig, RuleConfig,
    ServerConfig, SpecialHost,
};
pub use validator::ConfigValidator;
