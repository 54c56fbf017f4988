mod definition;
mod run;
mod schedule;

pub use definition::*;
pub use run::*;
pub use schedule::*;
