pub mod cancel;
pub mod error;
pub mod pipe;

// Command contract + concretions
pub mod command;
pub mod compose;
pub mod init;
pub mod process;
pub mod tree;

// Orchestration
pub mod commander;

// Compose project model + port conflict handling
pub mod ports;
pub mod project;

// UI support
pub mod linebuf;

#[cfg(test)]
mod testing;

/// Locks a std mutex, absorbing poisoning. Critical sections in this crate
/// are short and never await.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
