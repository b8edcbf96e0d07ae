pub mod engine;
pub mod frame;
pub mod source;

pub use engine::{
    Classification, Device, EngineStats, IngestOutcome, ObservationDelta, PacketEngine,
};
pub use frame::{parse_frame, FrameError, FrameKind, ParsedFrame};
pub use source::{FrameSource, ReplayFileSource, SourceError};
