pub mod operation;
pub mod position;

pub use operation::*;
pub use position::*;
