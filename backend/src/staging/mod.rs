//! Staging: capacity-limited scratch space and the disk catalog.
//!
//! ```text
//!  scan worker ──reserve(bytes)──► StagingStore ──(FIFO semaphore, KiB granules)
//!       │                              │
//!       └──create(name, class)─────────┴──► Catalog (disk, slot) -> entry
//!                                            │
//!                             StagingFile ◄──┘  delete/drop releases space
//! ```

pub mod catalog;
pub mod store;

pub use catalog::{Catalog, CatalogEntry, CatalogKey, DiskId, FileKind, SlotId};
pub use store::{whole_granules, StagingFile, StagingReservation, StagingStore, GRANULE_BYTES};
