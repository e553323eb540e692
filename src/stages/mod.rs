pub mod catalogue;
pub mod checklist;
pub mod convergence;
pub mod orchestrator;
pub mod runner;

pub use catalogue::*;
pub use checklist::*;
pub use convergence::*;
pub use orchestrator::*;
pub use runner::*;
