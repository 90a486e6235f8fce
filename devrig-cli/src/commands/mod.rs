mod clean;
mod init;

pub use clean::run_clean;
pub use init::run_init;
