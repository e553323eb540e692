pub mod backoff;
pub mod client;
pub mod openai;
pub mod parse;
pub mod prompts;
pub mod scripted;
pub mod validation;

pub use backoff::*;
pub use client::*;
pub use openai::*;
pub use parse::*;
pub use prompts::*;
pub use scripted::*;
pub use validation::*;
