//! Service layer: image I/O, progress reporting and debug artifacts

pub mod debug;
pub mod io;
pub mod progress;

pub use debug::{DebugImage, DebugSink, DirectoryDebugSink, MemoryDebugSink, NoOpDebugSink};
pub use io::ImageIOService;
pub use progress::{
    CompletionSummary, ConsoleProgressReporter, NoOpProgressReporter, ProgressReporter, ProgressUpdate,
    RecordingProgressReporter,
};
