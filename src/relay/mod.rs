//! Exit-relay discovery and distribution.
//!
//! The directory client fetches relay metadata once at startup (optionally
//! on a refresh interval); the distributor deals fingerprints out to
//! workers so outbound paths stay diverse.

mod directory;
mod distribute;

pub use directory::{parse_relays, DirectoryClient};
pub use distribute::distribute;
