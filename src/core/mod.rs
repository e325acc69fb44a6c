pub mod error;
pub mod types;
pub mod value;

pub use error::{ContextError, Result};
pub use types::{Row, row};
pub use value::Value;
