pub mod toml_loader;

pub use toml_loader::{load_all_toml_records, load_toml_to_school_record};
