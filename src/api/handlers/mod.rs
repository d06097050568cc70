mod admin;
mod content;
mod files;
mod links;
mod storage;
mod uploads;
mod variants;

pub use admin::health;
pub use content::serve_content;
pub use files::{
    archive_file, create_file, delete_file, get_file, list_files, move_file, restore_file,
    update_file,
};
pub use links::{content_event, create_file_link, delete_file_link, list_file_links};
pub use storage::{storage_get, storage_put};
pub use uploads::{finalize_upload, init_upload, upload_content};
pub use variants::{
    derive_variants, finalize_variant_upload, init_variant_upload, list_variants,
    variant_content,
};
