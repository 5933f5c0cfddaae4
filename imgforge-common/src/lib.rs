pub mod arch;
pub mod checksum;
pub mod datasizes;
pub mod error;
pub mod seed;

pub use arch::Arch;
pub use datasizes::Size;
pub use error::{CommonError, SizeError};
