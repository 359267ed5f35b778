pub mod classifier;
pub mod watcher;
