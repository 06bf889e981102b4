pub mod restart;

pub use restart::{PROCESSED_ANNOTATION, RESTARTED_AT_ANNOTATION};
