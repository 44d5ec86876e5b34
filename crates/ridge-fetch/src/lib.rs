//! ridge-fetch: parallel reliable-UDP download client.
//!
//! A file is split into up to four byte ranges (`plan`), each fetched on its
//! own socket (`part`) and written straight into a pre-sized file at its
//! offset (`coordinator`). `watch` drives downloads from an input file.

pub mod coordinator;
pub mod display;
pub mod part;
pub mod plan;
pub mod watch;

pub use coordinator::Client;
pub use plan::{plan_parts, PartPlan};
pub use watch::{InputWatcher, ScanReport};
