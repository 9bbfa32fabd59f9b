//! The rendering engine seam.
//!
//! The pipeline never draws anything itself. It asks a [`Renderer`] for an
//! image in one of the engine's native kinds and reshapes the answer.

use crate::request::{Payload, RequestKind};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use semver::Version;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::string::FromUtf8Error;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output kinds an engine can produce natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ImageKind {
    #[serde(rename = "png")]
    Png,
    #[serde(rename = "jpeg")]
    Jpeg,
    #[serde(rename = "webp")]
    Webp,
    #[serde(rename = "svg")]
    Svg,
    #[serde(rename = "full-json")]
    FullJson,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Png => "png",
            ImageKind::Jpeg => "jpeg",
            ImageKind::Webp => "webp",
            ImageKind::Svg => "svg",
            ImageKind::FullJson => "full-json",
        }
    }

    pub fn is_raster(self) -> bool {
        matches!(self, ImageKind::Png | ImageKind::Jpeg | ImageKind::Webp)
    }
}

/// How the engine should treat the figure background.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    #[default]
    None,
    /// Paint the background before drawing; the format has no alpha.
    Opaque,
    /// Report the background color and draw on a transparent canvas.
    Capture,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOptions {
    pub format: ImageKind,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
    pub image_data_only: bool,
    pub set_background: BackgroundMode,
}

/// What an engine reports about itself before any render is attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub engine: String,
    pub family: RequestKind,
    pub version: Version,
    pub kinds: Vec<ImageKind>,
}

impl Capabilities {
    /// A chart engine producing every native kind.
    pub fn chart(engine: impl Into<String>, version: Version) -> Self {
        Self {
            engine: engine.into(),
            family: RequestKind::Chart,
            version,
            kinds: vec![
                ImageKind::Png,
                ImageKind::Jpeg,
                ImageKind::Webp,
                ImageKind::Svg,
                ImageKind::FullJson,
            ],
        }
    }

    /// A diagram engine, which only emits SVG.
    pub fn diagram(engine: impl Into<String>, version: Version) -> Self {
        Self {
            engine: engine.into(),
            family: RequestKind::Diagram,
            version,
            kinds: vec![ImageKind::Svg],
        }
    }

    pub fn supports(&self, kind: ImageKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// `name version: X.Y.Z`, used in capability failure messages.
    pub fn label(&self) -> String {
        format!("{} version: {}", self.engine, self.version)
    }
}

/// Everything the engine needs to draw one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderJob {
    pub payload: Payload,
    pub config: Map<String, Value>,
}

/// Raw engine answer: image data as text (data URI, bare base64, markup or
/// JSON) plus the background color when it was captured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageData {
    pub data: String,
    pub background: Option<String>,
}

impl ImageData {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            background: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{0}")]
    Engine(String),
    #[error("failed to spawn renderer {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("renderer exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("renderer i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("renderer produced invalid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("failed to encode render job: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Renderer: Send {
    fn capabilities(&self) -> Capabilities;

    /// Applies the engine configuration for the next render.
    async fn configure(&mut self, _config: &Map<String, Value>) -> Result<(), RenderError> {
        Ok(())
    }

    async fn render(
        &mut self,
        job: &RenderJob,
        options: &ImageOptions,
    ) -> Result<ImageData, RenderError>;
}

/// Runs an external engine once per render.
///
/// Diagram source goes to stdin as text, prefixed with an init directive when
/// there is configuration. Figures go to stdin as a JSON job
/// `{figure, config, options}`. The image is read from stdout. Arguments may
/// contain `{format}`, `{width}`, `{height}` and `{scale}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: PathBuf,
    args: Vec<String>,
    capabilities: Capabilities,
    config: Map<String, Value>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, capabilities: Capabilities) -> Self {
        Self {
            program: program.into(),
            args,
            capabilities,
            config: Map::new(),
        }
    }

    fn expand_args(&self, options: &ImageOptions) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{format}", options.format.as_str())
                    .replace("{width}", &options.width.to_string())
                    .replace("{height}", &options.height.to_string())
                    .replace("{scale}", &options.scale.to_string())
            })
            .collect()
    }

    fn stdin_payload(&self, job: &RenderJob, options: &ImageOptions) -> Result<Vec<u8>, RenderError> {
        match &job.payload {
            Payload::Diagram(diagram) => {
                if self.config.is_empty() {
                    return Ok(diagram.source.clone().into_bytes());
                }
                let init = serde_json::to_string(&self.config)?;
                Ok(format!("%%{{init: {init}}}%%\n{}", diagram.source).into_bytes())
            }
            Payload::Figure(figure) => {
                let body = json!({
                    "figure": figure,
                    "config": self.config,
                    "options": options,
                });
                Ok(serde_json::to_vec(&body)?)
            }
        }
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn configure(&mut self, config: &Map<String, Value>) -> Result<(), RenderError> {
        self.config = config.clone();
        Ok(())
    }

    async fn render(
        &mut self,
        job: &RenderJob,
        options: &ImageOptions,
    ) -> Result<ImageData, RenderError> {
        let started_at = Instant::now();
        let program = self.program.display().to_string();
        let input = self.stdin_payload(job, options)?;

        let mut child = Command::new(&self.program)
            .args(self.expand_args(options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Feed stdin concurrently so a chatty engine cannot fill its stdout
        // pipe while we are still writing.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The engine may exit without draining stdin; its status decides.
                Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Ok(Err(err)) => return Err(RenderError::Io(err)),
                Err(err) => return Err(RenderError::Engine(err.to_string())),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                program = %program,
                exit_code = output.status.code().unwrap_or(-1),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                stderr = %stderr,
                "renderer invocation failed"
            );
            return Err(RenderError::Exit {
                code: output.status.code(),
                stderr,
            });
        }

        debug!(
            program = %program,
            format = options.format.as_str(),
            bytes = output.stdout.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "renderer finished"
        );

        if options.format.is_raster() {
            return Ok(ImageData::new(raster_text(options.format, output.stdout)));
        }
        let text = String::from_utf8(output.stdout)?;
        Ok(ImageData::new(text.trim_end()))
    }
}

/// Raster engines may print a data URI, bare base64, or the image bytes.
fn raster_text(kind: ImageKind, stdout: Vec<u8>) -> String {
    if let Ok(text) = std::str::from_utf8(&stdout) {
        let text = text.trim();
        if text.starts_with("data:") || (!text.is_empty() && STANDARD.decode(text).is_ok()) {
            return text.to_string();
        }
    }
    format!("data:image/{};base64,{}", kind.as_str(), STANDARD.encode(&stdout))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::request::{Diagram, Figure};

    fn options(format: ImageKind) -> ImageOptions {
        ImageOptions {
            format,
            width: 700.0,
            height: 500.0,
            scale: 1.0,
            image_data_only: false,
            set_background: BackgroundMode::None,
        }
    }

    fn diagram_job(source: &str) -> RenderJob {
        RenderJob {
            payload: Payload::Diagram(Diagram {
                source: source.to_string(),
                init_config: Map::new(),
            }),
            config: Map::new(),
        }
    }

    fn shell(script: &str) -> CommandRenderer {
        CommandRenderer::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            Capabilities::diagram("sh", Version::new(1, 0, 0)),
        )
    }

    #[tokio::test]
    async fn pipes_diagram_source_through_the_engine() {
        let mut renderer = shell("cat");
        let image = renderer
            .render(&diagram_job("graph TD; A-->B"), &options(ImageKind::Svg))
            .await
            .unwrap();
        assert_eq!(image.data, "graph TD; A-->B");
        assert_eq!(image.background, None);
    }

    #[tokio::test]
    async fn configuration_becomes_an_init_directive() {
        let mut renderer = shell("cat");
        let mut config = Map::new();
        config.insert("theme".into(), json!("dark"));
        renderer.configure(&config).await.unwrap();
        let image = renderer
            .render(&diagram_job("pie"), &options(ImageKind::Svg))
            .await
            .unwrap();
        assert_eq!(image.data, "%%{init: {\"theme\":\"dark\"}}%%\npie");
    }

    #[tokio::test]
    async fn substitutes_argument_placeholders() {
        let mut renderer = shell("echo {format} {width} {height} {scale}");
        let image = renderer
            .render(&diagram_job("x"), &options(ImageKind::Svg))
            .await
            .unwrap();
        assert_eq!(image.data, "svg 700 500 1");
    }

    #[tokio::test]
    async fn figures_are_sent_as_json_jobs() {
        let mut renderer = shell("cat");
        let job = RenderJob {
            payload: Payload::Figure(Figure {
                data: vec![json!({"type": "bar"})],
                layout: Map::new(),
            }),
            config: Map::new(),
        };
        let image = renderer.render(&job, &options(ImageKind::Svg)).await.unwrap();
        let echoed: Value = serde_json::from_str(&image.data).unwrap();
        assert_eq!(echoed["figure"]["data"][0]["type"], "bar");
        assert_eq!(echoed["options"]["format"], "svg");
        assert_eq!(echoed["options"]["setBackground"], "none");
    }

    #[tokio::test]
    async fn raster_bytes_are_wrapped_as_data_uri() {
        let mut renderer = shell("printf '\\211PNG\\r\\n'");
        let image = renderer
            .render(&diagram_job("x"), &options(ImageKind::Png))
            .await
            .unwrap();
        assert!(image.data.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn surfaces_exit_status_and_stderr() {
        let mut renderer = shell("echo boom >&2; exit 42");
        let err = renderer
            .render(&diagram_job("x"), &options(ImageKind::Svg))
            .await
            .unwrap_err();
        match err {
            RenderError::Exit { code, stderr } => {
                assert_eq!(code, Some(42));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let mut renderer = CommandRenderer::new(
            "/nonexistent/engine",
            Vec::new(),
            Capabilities::diagram("missing", Version::new(1, 0, 0)),
        );
        let err = renderer
            .render(&diagram_job("x"), &options(ImageKind::Svg))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Spawn { .. }));
    }

    #[test]
    fn capability_labels_and_kinds() {
        let caps = Capabilities::chart("plotly", Version::new(2, 35, 2));
        assert_eq!(caps.label(), "plotly version: 2.35.2");
        assert!(caps.supports(ImageKind::FullJson));
        let caps = Capabilities::diagram("mermaid", Version::new(11, 0, 0));
        assert!(!caps.supports(ImageKind::Png));
    }
}
