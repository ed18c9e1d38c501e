//! Boot plan configuration parsing and validation

mod boot_plan;

pub use boot_plan::*;
