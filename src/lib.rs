pub mod config;
pub mod error;
pub mod format;
pub mod hang;
pub mod orchestrator;
pub mod output;
pub mod pool;
pub mod postprocess;
pub mod renderer;
pub mod request;
pub mod surface;
pub mod telemetry;
pub mod validate;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::{ExporterOptions, load_options};
pub use error::ExportError;
pub use format::{Format, StatusCode};
pub use orchestrator::{ExportResult, Orchestrator, RenderOutcome};
pub use pool::ExporterPool;
pub use renderer::{Capabilities, CommandRenderer, ImageData, RenderError, RenderJob, Renderer};
pub use request::{ExportRequest, ExportSpec, Payload};
pub use validate::validate;

#[cfg(feature = "cli")]
pub use cli::run;
