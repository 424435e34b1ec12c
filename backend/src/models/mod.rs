pub mod descriptor;
pub mod macros;
pub mod scan;
pub mod solution;
pub mod time;
pub mod visibility;

pub use descriptor::*;
pub use scan::*;
pub use solution::*;
pub use visibility::*;
