//! Core backup machinery.
//!
//! Everything the controller needs to turn a backupset config into an
//! on-disk, catalogued backup:
//! - Configuration trees and configspec validation
//! - Plugin registries and loaders
//! - Byte streams through external compressors
//! - Archivers (tar, directory copy)
//! - The spool, the catalog, the hook pipeline, and the controller itself

pub mod archive;
pub mod backup_plugin;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod estimation;
pub mod hooks;
pub mod plugin;
pub mod result_error;
pub mod spool;
pub mod stream;
pub mod util;

macro_rules! function_path {
    () => {
        concat!(
            module_path!(),
            "::",
            function_name!(),
            " ",
            file!(),
            ":",
            line!()
        )
    };
}

pub(crate) use function_path;
