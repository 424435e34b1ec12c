//! UV data: binary layout, axis-order mapping and parameter conversions.
//!
//! ```text
//! Scan (source layout) --AxisPlan--> file order --UvWriter--> staging file
//!                                                 UvReader <-- staging file
//! ```

pub mod codec;
pub mod conversions;
pub mod layout;

pub use codec::{file_size, inspect, time_span, UvFileInfo, UvReader, UvWriter};
pub use conversions::{
    aips_antenna, antenna_name, decode_baseline, encode_baseline, metres_to_wavelengths,
};
pub use layout::AxisPlan;
