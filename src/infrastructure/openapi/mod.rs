pub mod discovery;
pub mod document;

pub use discovery::{discover_spec, load_spec, parse_document, SpecError, PROBE_PATHS};
pub use document::Document;
