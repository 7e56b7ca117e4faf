pub mod command;
pub mod reconcile;
pub mod runtime;
pub mod store;
pub mod watcher;
pub mod workspace;

#[cfg(test)]
pub mod testing;
