pub mod catalog;
pub mod daemon;
pub mod events;
pub mod import;
pub mod logging;
pub mod sync;
