mod definition;
mod run;

pub use definition::*;
pub use run::*;
