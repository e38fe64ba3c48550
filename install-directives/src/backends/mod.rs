mod cli;

pub use cli::CliBackend;
