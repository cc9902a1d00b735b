//! Record source: loads input files into ordered record collections.
//!
//! Every row gets a stable zero-based index from its position in the input
//! (or in the concatenation of all inputs when files are combined). Rows that
//! fail to parse keep their slot so that no other record is renumbered.

pub mod loader;
pub mod record;

pub use loader::{load_datasets, load_file, resolve_inputs, InputFormat, COMBINED_DATASET_NAME};
pub use record::{Dataset, Record, RecordSlot};
