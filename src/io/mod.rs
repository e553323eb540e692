pub mod output;
pub mod progress;
pub mod store;

pub use output::*;
pub use progress::*;
pub use store::*;
