//! Configuration module: `passvault.toml` settings.

pub mod settings;

pub use settings::Settings;
