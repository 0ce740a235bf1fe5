mod error;
pub use error::{CorruptionReport, LoaderError, LoaderResult};

pub mod clock;
pub use clock::{Clock, ManualClock, Poller, RecordingSleeper, Sleeper, SystemClock, ThreadSleeper};

pub mod config;
pub use config::{CorruptionPolicy, StreamingConfig};

pub mod platform_io;
pub use platform_io::{DiskIoBackend, IoBackend, IoHandle, MemoryIoBackend};

pub mod decompress;
pub use decompress::{Decompressor, StandardDecompressor};

pub mod async_io;
pub use async_io::{
    AsyncIoService, CompletionCounter, IoBuffer, IoPriority, IoServiceOptions, IoStats,
    ReadRequest, RequestId,
};

mod precache_reader;
pub use precache_reader::PrecachingReader;

pub mod manifest;
pub use manifest::{PackageManifest, PackageResolver, ResolvedPackage};

pub mod overlay;
pub use overlay::{MemoryPatchOverlay, PackagePatch, PatchOverlay};

pub mod reservations;
pub use reservations::{ImmediateReservations, PendingReservations, ReservationService};

mod objects;
pub use objects::{ObjectRecord, ObjectTable};

mod serializer;
pub use serializer::{ExportReader, LoadContext, ObjectSerializer, RawDataSerializer};

mod linker;
pub use linker::{LinkerExport, PackageLinker};

mod package_job;
pub use package_job::{
    JobStats, LoadCallback, LoadPhase, LoadedPackage, PackageLoadJob, PackageLoadResult,
};

mod coordinator;
pub use coordinator::{LoadCoordinator, LoadRequest, LoaderServices};

mod streaming_loader;
pub use streaming_loader::StreamingLoader;

pub use streamload_base::{ObjectHandle, PackageGuid};

#[cfg(test)]
mod tests;
