pub mod grade;
pub mod loaders;
pub mod record;
pub mod section;

pub use grade::{derive_grade_level, GradeLevel};
pub use loaders::{load_all_toml_records, load_toml_to_school_record};
pub use record::{Draft, Owner, PersistedRecord, Row, SchoolRecord, SubmissionMethod};
pub use section::{to_client, to_storage, FieldSpec, FieldValue, SectionKey, StorageRow, StorageSections, ValueKind};
