//! Device registry stores.
//!
//! Both stores share the row rules in [`table`]; the file store additionally
//! writes the whole document through a temp file and rename before the new
//! state becomes visible.

mod file;
mod memory;
mod table;

pub use file::FileDeviceRegistry;
pub use memory::InMemoryDeviceRegistry;
