//! Reference tool bodies exercising the executor's security gates (spec
//! §4.7): a shell runner with a command blocklist, a symlink-safe file
//! reader with a path allow-list, and a scheme/size-capped web fetcher.

pub mod file;
pub mod shell;
pub mod web;

pub use file::ReadFileTool;
pub use shell::ShellTool;
pub use web::WebFetchTool;
