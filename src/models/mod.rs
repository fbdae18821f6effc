mod account;
mod key;
pub mod key_gen;
mod usage;

pub use account::*;
pub use key::*;
pub use key_gen::*;
pub use usage::*;
