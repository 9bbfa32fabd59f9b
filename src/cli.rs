use crate::config::load_options;
use crate::format::Format;
use crate::orchestrator::{ExportResult, RenderOutcome};
use crate::output::{format_from_path, resolve_output_path, title_prefix};
use crate::pool::ExporterPool;
use crate::renderer::{Capabilities, CommandRenderer};
use crate::request::{ExportRequest, Figure, RequestKind};
use crate::telemetry::{self, LogFormat};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use semver::Version;
use serde_json::{Value, json};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

const DEFAULT_ENGINE_VERSION: &str = "2.35.2";

#[derive(Parser, Debug)]
#[command(name = "figx", version, about = "Export charts and diagrams to static images")]
pub struct Args {
    /// Request files (.json, .mmd, .md) or '-' for stdin
    #[arg(short = 'i', long = "input")]
    pub input: Vec<PathBuf>,

    /// Output file or directory. Envelopes are printed to stdout if omitted.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Treat every request as a chart or a diagram
    #[arg(short = 'k', long = "kind", value_enum)]
    pub kind: Option<KindArg>,

    /// Rendering engine executable
    #[arg(short = 'r', long = "renderer")]
    pub renderer: PathBuf,

    /// Engine argument; {format}, {width}, {height} and {scale} are substituted
    #[arg(long = "renderer-arg", allow_hyphen_values = true)]
    pub renderer_args: Vec<String>,

    /// Version the engine reports
    #[arg(long = "renderer-version", default_value = DEFAULT_ENGINE_VERSION)]
    pub renderer_version: Version,

    /// Reject figures likely to stall the engine
    #[arg(long = "safe-mode")]
    pub safe_mode: bool,

    /// Exporter options JSON file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Number of engines run side by side
    #[arg(short = 'j', long = "jobs", default_value_t = 1)]
    pub jobs: usize,

    /// Per-render timeout in milliseconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    #[arg(long = "log-format", value_enum, default_value = "compact")]
    pub log_format: LogFormat,

    /// Converter for pdf/eps/emf, run as `<cmd> <format> <output>` with the
    /// print document or vector markup on stdin
    #[arg(long = "convert-command")]
    pub convert_command: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Chart,
    Diagram,
}

impl From<KindArg> for RequestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Chart => RequestKind::Chart,
            KindArg::Diagram => RequestKind::Diagram,
        }
    }
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    telemetry::init(args.log_format)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(args))
}

async fn execute(args: Args) -> Result<()> {
    let mut options = load_options(args.config.as_deref())?;
    options.safe_mode |= args.safe_mode;
    if args.timeout.is_some() {
        options.render_timeout_ms = args.timeout;
    }

    let inputs = read_inputs(&args.input)?;
    let kind = args
        .kind
        .map(RequestKind::from)
        .unwrap_or_else(|| guess_kind(&inputs));
    let implied_format = args.output.as_deref().and_then(format_from_path);
    let bodies: Vec<Value> = inputs
        .into_iter()
        .flat_map(|input| input.into_bodies(kind))
        .map(|body| with_default_format(body, implied_format))
        .collect::<Result<_>>()?;
    if bodies.is_empty() {
        bail!("No export requests found in input");
    }

    let engine = args
        .renderer
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("engine")
        .to_string();
    let capabilities = match kind {
        RequestKind::Chart => Capabilities::chart(engine, args.renderer_version.clone()),
        RequestKind::Diagram => Capabilities::diagram(engine, args.renderer_version.clone()),
    };
    let renderer = CommandRenderer::new(&args.renderer, args.renderer_args.clone(), capabilities);
    let pool = ExporterPool::new(
        std::iter::repeat_n(renderer, args.jobs.max(1)),
        options,
    )?;
    info!(workers = pool.size(), "exporter pool ready");

    let requests: Vec<ExportRequest> = bodies
        .into_iter()
        .map(|body| ExportRequest::with_kind(body, kind))
        .collect();
    let figures: Vec<Option<Figure>> = requests.iter().map(figure_of).collect();
    let outcomes = pool.export_all(requests).await;

    let count = outcomes.len();
    let mut failures = 0;
    for (idx, (outcome, figure)) in outcomes.iter().zip(&figures).enumerate() {
        if !outcome.is_success() {
            failures += 1;
            warn!(
                index = idx,
                code = outcome.code.as_u16(),
                detail = outcome.message.as_deref().unwrap_or_default(),
                "export failed"
            );
        }
        match args.output.as_deref() {
            None => print_envelope(outcome)?,
            Some(_) if !outcome.is_success() => {}
            Some(base) => {
                let path = output_path(base, figure.as_ref(), outcome, idx, count)?;
                write_outcome(outcome, &path, args.convert_command.as_deref()).await?;
                info!(path = %path.display(), "wrote export");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {count} exports failed");
    }
    Ok(())
}

#[derive(Debug)]
struct Input {
    content: String,
    source: InputSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputSource {
    Json,
    Markdown,
    Diagram,
}

impl Input {
    /// Request bodies held by this input. JSON may hold one request or an
    /// array of them; markdown contributes one request per mermaid block.
    fn into_bodies(self, kind: RequestKind) -> Vec<Result<Value>> {
        match self.source {
            InputSource::Markdown => extract_mermaid_blocks(&self.content)
                .into_iter()
                .map(|block| Ok(json!({ "data": block })))
                .collect(),
            InputSource::Diagram => vec![Ok(json!({ "data": self.content }))],
            InputSource::Json => match serde_json::from_str::<Value>(&self.content) {
                Ok(Value::Array(items)) => items.into_iter().map(Ok).collect(),
                Ok(value) => vec![Ok(value)],
                // Bare diagram text piped to a diagram engine.
                Err(_) if kind == RequestKind::Diagram => {
                    vec![Ok(json!({ "data": self.content }))]
                }
                Err(err) => vec![Err(err).context("input is not valid JSON")],
            },
        }
    }
}

fn read_inputs(paths: &[PathBuf]) -> Result<Vec<Input>> {
    if paths.is_empty() {
        return Ok(vec![read_input(Path::new("-"))?]);
    }
    paths.iter().map(|path| read_input(path)).collect()
}

fn read_input(path: &Path) -> Result<Input> {
    if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        return Ok(Input {
            content: buf,
            source: InputSource::Json,
        });
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let source = match path.extension().and_then(|e| e.to_str()) {
        Some("md" | "markdown") => InputSource::Markdown,
        Some("mmd" | "mermaid") => InputSource::Diagram,
        _ => InputSource::Json,
    };
    Ok(Input { content, source })
}

fn guess_kind(inputs: &[Input]) -> RequestKind {
    if !inputs.is_empty() && inputs.iter().all(|input| input.source != InputSource::Json) {
        RequestKind::Diagram
    } else {
        RequestKind::Chart
    }
}

fn with_default_format(body: Result<Value>, format: Option<Format>) -> Result<Value> {
    let mut body = body?;
    if let (Some(format), Value::Object(object)) = (format, &mut body) {
        object
            .entry("format")
            .or_insert_with(|| json!(format.as_str()));
    }
    Ok(body)
}

fn figure_of(request: &ExportRequest) -> Option<Figure> {
    let ExportRequest::Chart(chart) = request else {
        return None;
    };
    let layout = chart.figure.get("layout")?.as_object()?.clone();
    Some(Figure {
        data: Vec::new(),
        layout,
    })
}

fn print_envelope(outcome: &RenderOutcome) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, outcome)?;
    writeln!(stdout)?;
    Ok(())
}

/// A single export uses the output as given. Batches written to a file path
/// become `stem-1.ext`, `stem-2.ext`, ...
fn output_path(
    base: &Path,
    figure: Option<&Figure>,
    outcome: &RenderOutcome,
    idx: usize,
    count: usize,
) -> Result<PathBuf> {
    let format = outcome.format.unwrap_or(Format::Png);
    if count == 1 || base.is_dir() || base.extension().is_none() {
        return resolve_output_path(base, figure, format);
    }
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| title_prefix(figure));
    let parent = base.parent().unwrap_or_else(|| Path::new("."));
    resolve_output_path(
        &parent.join(format!("{}-{}.{}", stem, idx + 1, format.as_str())),
        figure,
        format,
    )
}

async fn write_outcome(outcome: &RenderOutcome, path: &Path, convert: Option<&Path>) -> Result<()> {
    let format = outcome.format.unwrap_or(Format::Png);
    let handoff = match (format, &outcome.page, &outcome.result) {
        (Format::Pdf | Format::Eps, Some(page), _) => Some((page.to_html(), "html")),
        (Format::Emf, _, Some(ExportResult::Text(markup))) => Some((markup.clone(), "svg")),
        _ => None,
    };

    let Some((document, fallback_ext)) = handoff else {
        let bytes = outcome.result.as_ref().map(ExportResult::as_bytes).unwrap_or_default();
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        return Ok(());
    };

    match convert {
        Some(program) => run_converter(program, format, path, document).await,
        None => {
            let fallback = path.with_extension(fallback_ext);
            warn!(
                format = %format,
                path = %fallback.display(),
                "no converter configured; writing intermediate document instead"
            );
            std::fs::write(&fallback, document)
                .with_context(|| format!("failed to write {}", fallback.display()))?;
            Ok(())
        }
    }
}

async fn run_converter(program: &Path, format: Format, output: &Path, document: String) -> Result<()> {
    let mut child = Command::new(program)
        .arg(format.as_str())
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn converter {}", program.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(document.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    let result = child.wait_with_output().await?;
    if !result.status.success() {
        bail!(
            "converter {} exited with {:?}: {}",
            program.display(),
            result.status.code(),
            String::from_utf8_lossy(&result.stderr).trim()
        );
    }
    Ok(())
}

fn extract_mermaid_blocks(input: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut in_block = false;
    let mut current = Vec::new();
    let mut fence = String::new();

    for line in input.lines() {
        let trimmed = line.trim();
        if !in_block {
            if let Some(start_fence) = detect_mermaid_fence(trimmed) {
                in_block = true;
                fence = start_fence;
                continue;
            }
        } else if is_fence_end(trimmed, &fence) {
            in_block = false;
            blocks.push(current.join("\n"));
            current.clear();
            continue;
        }

        if in_block {
            current.push(line.to_string());
        }
    }

    blocks
}

fn detect_mermaid_fence(line: &str) -> Option<String> {
    for fence in ["```", "~~~", ":::"] {
        if let Some(rest) = line.strip_prefix(fence) {
            let marker = fence.chars().next().unwrap_or('`');
            if rest.trim_start_matches(marker).trim().starts_with("mermaid") {
                return Some(fence.to_string());
            }
        }
    }
    None
}

fn is_fence_end(line: &str, fence: &str) -> bool {
    line.strip_prefix(fence)
        .is_some_and(|rest| rest.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_mermaid_blocks() {
        let input = r#"
text
``` mermaid
flowchart LR
  A --> B
```
more
~~~mermaid
flowchart TD
  X --> Y
~~~
::: mermaid
sequenceDiagram
  A->>B: hi
:::
"#;
        let blocks = extract_mermaid_blocks(input);
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].contains("flowchart LR"));
        assert!(blocks[1].contains("flowchart TD"));
        assert!(blocks[2].contains("sequenceDiagram"));
    }

    #[test]
    fn json_inputs_may_hold_batches() {
        let input = Input {
            content: r#"[{"data": []}, {"figure": {"layout": {}}}]"#.to_string(),
            source: InputSource::Json,
        };
        let bodies: Vec<_> = input
            .into_bodies(RequestKind::Chart)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(bodies.len(), 2);
    }

    #[test]
    fn bare_text_is_a_diagram_only_for_diagram_engines() {
        let input = || Input {
            content: "graph TD; A-->B".to_string(),
            source: InputSource::Json,
        };
        let bodies = input().into_bodies(RequestKind::Diagram);
        assert_eq!(bodies[0].as_ref().unwrap(), &json!({"data": "graph TD; A-->B"}));
        assert!(input().into_bodies(RequestKind::Chart)[0].is_err());
    }

    #[test]
    fn output_extension_fills_missing_format() {
        let body = with_default_format(Ok(json!({"data": []})), Some(Format::Svg)).unwrap();
        assert_eq!(body["format"], "svg");
        let body = with_default_format(Ok(json!({"format": "png"})), Some(Format::Svg)).unwrap();
        assert_eq!(body["format"], "png");
    }

    #[test]
    fn batch_outputs_are_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = RenderOutcome {
            code: crate::format::StatusCode::Success,
            message: None,
            result: None,
            format: Some(Format::Svg),
            width: None,
            height: None,
            scale: None,
            pdf_bg_color: None,
            page: None,
        };
        let base = dir.path().join("chart.svg");
        assert_eq!(output_path(&base, None, &outcome, 1, 3).unwrap(), dir.path().join("chart-2.svg"));
        assert_eq!(output_path(&base, None, &outcome, 0, 1).unwrap(), base);
    }

    #[tokio::test]
    async fn print_formats_fall_back_to_html_without_converter() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = RenderOutcome {
            code: crate::format::StatusCode::Success,
            message: None,
            result: None,
            format: Some(Format::Pdf),
            width: Some(10.0),
            height: Some(10.0),
            scale: Some(1.0),
            pdf_bg_color: Some("white".to_string()),
            page: Some(crate::surface::PrintPage {
                style: "@page { size: 10px 10px; }".to_string(),
                width: 10,
                height: 10,
                background: "white".to_string(),
                markup: "<svg/>".to_string(),
            }),
        };
        let path = dir.path().join("fig.pdf");
        write_outcome(&outcome, &path, None).await.unwrap();
        let html = std::fs::read_to_string(dir.path().join("fig.html")).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(!path.exists());
    }
}
