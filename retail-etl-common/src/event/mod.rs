mod log_record;
mod severity;

pub use log_record::*;
pub use severity::*;
