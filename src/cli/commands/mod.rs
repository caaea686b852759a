//! One module per subcommand. Each exposes an async `execute`.

pub mod create;
pub mod info;
pub mod passwd;
pub mod read;
pub mod write;
