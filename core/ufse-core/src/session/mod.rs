//! Session lifecycle: admission policy, ordering, and the concurrent store.

pub mod admission;
pub mod ordering;
pub mod state;
pub mod store;

pub use admission::Admission;
pub use ordering::{dedupe_events, sort_events};
pub use state::{CompletionReason, LiveSession};
pub use store::{IngestOutcome, SessionManager, StoreSnapshot};
