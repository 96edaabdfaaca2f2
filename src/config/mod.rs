//! Configuration loading: TOML file plus environment variable overrides.

pub mod settings;

pub use settings::Settings;
