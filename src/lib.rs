pub mod catalog;
pub mod config;
pub mod dump;
pub mod error;
pub mod locks;
pub mod logger;
pub mod reconciler;
pub mod router;
pub mod routing;
pub mod version;
pub mod watcher;
