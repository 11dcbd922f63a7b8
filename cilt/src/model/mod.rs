mod assembly;
mod method;
mod types;

pub mod access;

pub use assembly::*;
pub use method::*;
pub use types::*;
