pub mod domain;
pub mod engine;
pub mod entitlement;
pub mod filter;
pub mod memory;
pub mod ports;
pub mod reactions;
pub mod reports;
pub mod router;
pub mod settings;

pub use domain::{
    fields, new_record_id, BookmarkKind, Collection, Fields, Record, StickerSelector,
    UnlockSource, UserStats,
};
pub use entitlement::Entitlements;
pub use memory::MemoryStore;
pub use ports::{
    Clock, ManualClock, PortError, PortResult, RecordStore, RecordTx, SystemClock,
};
pub use reports::{ReportRejected, ReportSubmission};
pub use router::{EventRouter, MutationEvent, Phase, Reaction, RequestContext};
pub use settings::EngineSettings;
