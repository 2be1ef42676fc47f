/// Field-level conversion helpers (barrier parsing, cents, timestamps)
pub mod conversions;
/// Normalized domain entities persisted by the pipeline
pub mod domain;
/// Raw affiliate API payloads (forward-compatible)
pub mod upstream;

pub use domain::{
    Entrant, IntervalType, Meeting, MoneyFlowRecord, OddsRecord, OddsType, Race, RacePools,
    RaceStatus,
};
pub use upstream::{MeetingRef, RaceEventPayload, RaceListResponse};
