pub mod controller;
pub mod source;

pub use controller::{reconcile, run, run_workers, Context, JobKey, Outcome};
