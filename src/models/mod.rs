pub mod checklist;
pub mod ledger;
pub mod result;
pub mod schema;
pub mod stage;

pub use checklist::*;
pub use ledger::*;
pub use result::*;
pub use schema::*;
pub use stage::*;
