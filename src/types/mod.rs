//! Lane relay types.

mod message;
pub use message::*;

mod observation;
pub use observation::*;

mod report;
pub use report::*;
