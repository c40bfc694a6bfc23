mod interest;
mod state;
mod types;

// Re-export public types
pub use interest::{Constraint, ObjectInterest, pattern_matches};
pub use state::{GraphState, natural_cmp};
pub use types::*;
