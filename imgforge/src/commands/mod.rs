//! CLI command implementations.

pub mod build;
pub mod completions;
pub mod gen_partition_stages;
pub mod gen_partition_table;
pub mod inspect;
pub mod list_images;
pub mod manifest;
pub mod schema;
