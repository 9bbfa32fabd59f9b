//! Render orchestration.
//!
//! One export runs through a fixed sequence of named states:
//!
//! `Init -> CapabilityGate -> Dispatch -> Await -> Finalize -> Done`
//!
//! Any state may jump to `Failed`, which always ends in `Done`. The renderer
//! is only reached from `Dispatch`, so every rejection before that point is
//! guaranteed not to touch the engine.

use crate::config::ExporterOptions;
use crate::error::ExportError;
use crate::format::{
    BASE64_PREFIX, DIRECT_EXPORT_VERSION, Format, MIN_CHART_ENGINE_VERSION, RASTER_URI_PREFIX,
    STRUCTURED_EXPORT_VERSION, SVG_URI_PREFIX, StatusCode,
};
use crate::hang::is_likely_to_hang;
use crate::postprocess::color::Rgb;
use crate::postprocess::{clean_vector, resolve_background};
use crate::renderer::{
    BackgroundMode, ImageData, ImageKind, ImageOptions, RenderError, RenderJob, Renderer,
};
use crate::request::{ExportRequest, ExportSpec, Payload, RequestKind};
use crate::surface::{DisplaySurface, PrintPage, rasterize_svg};
use crate::validate::validate;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const TRANSPARENT: &str = "rgba(0,0,0,0)";
const HANG_REJECTION: &str = "figure data is likely to make exporter hang, rejecting request";

/// Export payload: text for data URIs, markup and JSON, bytes for decoded
/// raster images. Bytes serialize as base64.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportResult {
    Text(String),
    Binary(Vec<u8>),
}

impl ExportResult {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ExportResult::Text(text) => text.as_bytes(),
            ExportResult::Binary(bytes) => bytes,
        }
    }
}

impl Serialize for ExportResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ExportResult::Text(text) => serializer.serialize_str(text),
            ExportResult::Binary(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
        }
    }
}

/// The single envelope produced for every export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOutcome {
    pub code: StatusCode,
    pub message: Option<String>,
    pub result: Option<ExportResult>,
    pub format: Option<Format>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub scale: Option<f64>,
    pub pdf_bg_color: Option<String>,
    /// Page to print for pdf/eps exports; handed to the host, not serialized.
    #[serde(skip)]
    pub page: Option<PrintPage>,
}

impl RenderOutcome {
    fn new(code: StatusCode, message: Option<String>, spec: Option<&ExportSpec>) -> Self {
        Self {
            code,
            message,
            result: None,
            format: spec.map(|spec| spec.format),
            width: spec.map(|spec| spec.width),
            height: spec.map(|spec| spec.height),
            scale: spec.map(|spec| spec.scale),
            pdf_bg_color: None,
            page: None,
        }
    }

    pub fn success(spec: &ExportSpec, result: Option<ExportResult>) -> Self {
        let mut outcome = Self::new(StatusCode::Success, None, Some(spec));
        outcome.result = result;
        outcome
    }

    pub fn failure(error: ExportError, spec: Option<&ExportSpec>) -> Self {
        Self::new(error.code(), Some(error.message().to_string()), spec)
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Decisions taken by the capability gate.
#[derive(Debug, Clone)]
struct Plan {
    kind: ImageKind,
    /// Ask for svg and rasterize locally.
    rasterize: bool,
    /// Engine predates direct export; data URI prefixes are ours to strip.
    legacy: bool,
    captured_background: Option<String>,
}

enum State {
    Init,
    CapabilityGate {
        job: RenderJob,
        captured_background: Option<String>,
    },
    Dispatch {
        job: RenderJob,
        plan: Plan,
    },
    Await {
        pending: BoxFuture<'static, Result<ImageData, RenderError>>,
        plan: Plan,
    },
    Finalize {
        image: ImageData,
        plan: Plan,
    },
    Failed(ExportError),
    Done(RenderOutcome),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Init => "init",
            State::CapabilityGate { .. } => "capability_gate",
            State::Dispatch { .. } => "dispatch",
            State::Await { .. } => "await",
            State::Finalize { .. } => "finalize",
            State::Failed(_) => "failed",
            State::Done(_) => "done",
        }
    }
}

/// Drives one renderer. Configuration and rendering for a job happen under a
/// single lock on the renderer, so concurrent exports never interleave there.
pub struct Orchestrator<R> {
    renderer: Arc<Mutex<R>>,
    options: ExporterOptions,
}

impl<R> Clone for Orchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            renderer: Arc::clone(&self.renderer),
            options: self.options.clone(),
        }
    }
}

impl<R: Renderer + 'static> Orchestrator<R> {
    pub fn new(renderer: R, options: ExporterOptions) -> Self {
        Self::shared(Arc::new(Mutex::new(renderer)), options)
    }

    pub fn shared(renderer: Arc<Mutex<R>>, options: ExporterOptions) -> Self {
        Self { renderer, options }
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    pub fn renderer(&self) -> &Arc<Mutex<R>> {
        &self.renderer
    }

    /// Validates, screens and renders a raw request.
    #[instrument(skip_all, fields(kind = ?request.kind()))]
    pub async fn export(&self, request: &ExportRequest) -> RenderOutcome {
        let spec = match validate(request, &self.options) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(code = err.code().as_u16(), detail = err.message(), "request rejected");
                return RenderOutcome::failure(err, None);
            }
        };

        if self.options.safe_mode && is_likely_to_hang(&spec) {
            warn!("figure rejected by hang estimator");
            let err = ExportError::with_extra(StatusCode::Malformed, HANG_REJECTION);
            return RenderOutcome::failure(err, Some(&spec));
        }

        self.render(&spec).await
    }

    /// Renders a validated request. Never fails: errors become outcomes.
    #[instrument(skip_all, fields(format = %spec.format))]
    pub async fn render(&self, spec: &ExportSpec) -> RenderOutcome {
        let mut state = State::Init;
        loop {
            debug!(state = state.name(), "orchestrator step");
            state = match state {
                State::Init => self.init(spec),
                State::CapabilityGate {
                    job,
                    captured_background,
                } => self.gate(spec, job, captured_background).await,
                State::Dispatch { job, plan } => self.dispatch(spec, job, plan),
                State::Await { pending, plan } => self.await_image(pending, plan).await,
                State::Finalize { image, plan } => finalize(spec, image, plan, &self.options).await,
                State::Failed(err) => {
                    warn!(code = err.code().as_u16(), detail = err.message(), "export failed");
                    State::Done(RenderOutcome::failure(err, Some(spec)))
                }
                State::Done(outcome) => {
                    if outcome.is_success() {
                        info!(width = spec.width, height = spec.height, "export completed");
                    }
                    return outcome;
                }
            };
        }
    }

    fn init(&self, spec: &ExportSpec) -> State {
        let mut payload = spec.payload.clone();
        let mut captured_background = None;

        let config = match &mut payload {
            Payload::Figure(figure) => {
                if spec.format.is_print() {
                    let background = figure
                        .paper_background()
                        .map(str::to_string)
                        .unwrap_or_else(|| Rgb::WHITE.to_string());
                    figure
                        .layout
                        .insert("paper_bgcolor".to_string(), json!(TRANSPARENT));
                    captured_background = Some(background);
                }
                self.chart_config(&spec.config)
            }
            Payload::Diagram(diagram) => {
                let mut config = diagram.init_config.clone();
                config.extend(spec.config.clone());
                config
            }
        };

        State::CapabilityGate {
            job: RenderJob { payload, config },
            captured_background,
        }
    }

    /// Engine defaults with the request's config laid over them.
    fn chart_config(&self, overrides: &Map<String, Value>) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert(
            "mapboxAccessToken".to_string(),
            self.options
                .mapbox_token()
                .map_or(Value::Null, |token| json!(token)),
        );
        config.insert("plotGlPixelRatio".to_string(), json!(self.options.pixel_ratio()));
        if let Some(url) = self.options.topojson() {
            config.insert("topojsonURL".to_string(), json!(url));
        }
        config.extend(overrides.clone());
        config
    }

    async fn gate(
        &self,
        spec: &ExportSpec,
        job: RenderJob,
        captured_background: Option<String>,
    ) -> State {
        let capabilities = self.renderer.lock().await.capabilities();
        let family = match spec.payload {
            Payload::Figure(_) => RequestKind::Chart,
            Payload::Diagram(_) => RequestKind::Diagram,
        };

        if capabilities.family != family {
            let kind = match family {
                RequestKind::Chart => "chart",
                RequestKind::Diagram => "diagram",
            };
            return State::Failed(ExportError::with_message(
                StatusCode::RendererLacksFeature,
                format!("{} cannot render {kind} requests", capabilities.label()),
            ));
        }

        let chart = family == RequestKind::Chart;
        if chart && capabilities.version < MIN_CHART_ENGINE_VERSION {
            return State::Failed(ExportError::with_message(
                StatusCode::RendererTooOld,
                capabilities.label(),
            ));
        }
        if chart && spec.format == Format::Json && capabilities.version < STRUCTURED_EXPORT_VERSION {
            return State::Failed(ExportError::with_message(
                StatusCode::RendererLacksFeature,
                capabilities.label(),
            ));
        }

        let native = native_kind(spec.format);
        let (kind, rasterize) = if capabilities.supports(native) {
            (native, false)
        } else if native == ImageKind::Png && capabilities.supports(ImageKind::Svg) {
            (ImageKind::Svg, true)
        } else {
            return State::Failed(ExportError::with_message(
                StatusCode::RendererLacksFeature,
                format!("{} cannot produce {}", capabilities.label(), native.as_str()),
            ));
        };

        State::Dispatch {
            job,
            plan: Plan {
                kind,
                rasterize,
                legacy: chart && capabilities.version < DIRECT_EXPORT_VERSION,
                captured_background,
            },
        }
    }

    fn dispatch(&self, spec: &ExportSpec, job: RenderJob, plan: Plan) -> State {
        let format = spec.format;
        let image_data_only = !plan.legacy
            && (format == Format::Emf || (format != Format::Pdf && !spec.encoded));
        let set_background = match format {
            Format::Jpeg | Format::Emf => BackgroundMode::Opaque,
            Format::Pdf | Format::Eps => BackgroundMode::Capture,
            _ => BackgroundMode::None,
        };
        let options = ImageOptions {
            format: plan.kind,
            width: spec.width,
            height: spec.height,
            scale: spec.scale,
            image_data_only,
            set_background,
        };

        let renderer = Arc::clone(&self.renderer);
        let pending = async move {
            let mut renderer = renderer.lock().await;
            renderer.configure(&job.config).await?;
            renderer.render(&job, &options).await
        }
        .boxed();

        State::Await { pending, plan }
    }

    async fn await_image(
        &self,
        pending: BoxFuture<'static, Result<ImageData, RenderError>>,
        plan: Plan,
    ) -> State {
        let result = match self.options.render_timeout() {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    return State::Failed(ExportError::with_message(
                        StatusCode::RendererError,
                        format!("render timed out after {} ms", limit.as_millis()),
                    ));
                }
            },
            None => pending.await,
        };

        match result {
            Ok(image) => State::Finalize { image, plan },
            Err(err) => State::Failed(ExportError::with_message(
                StatusCode::RendererError,
                err.to_string(),
            )),
        }
    }
}

fn native_kind(format: Format) -> ImageKind {
    match format {
        Format::Png => ImageKind::Png,
        Format::Jpeg => ImageKind::Jpeg,
        Format::Webp => ImageKind::Webp,
        Format::Svg | Format::Pdf | Format::Eps | Format::Emf => ImageKind::Svg,
        Format::Json => ImageKind::FullJson,
    }
}

fn conversion_error(detail: impl AsRef<str>) -> ExportError {
    ExportError::with_extra(StatusCode::ConversionError, detail)
}

async fn finalize(spec: &ExportSpec, image: ImageData, plan: Plan, options: &ExporterOptions) -> State {
    let outcome = match spec.format {
        Format::Png | Format::Jpeg | Format::Webp if plan.rasterize => {
            finalize_rasterized(spec, &image.data).await
        }
        Format::Png | Format::Jpeg | Format::Webp => finalize_raster(spec, &image.data),
        Format::Svg => finalize_svg(spec, &image.data),
        Format::Json => Ok(RenderOutcome::success(spec, Some(ExportResult::Text(image.data)))),
        Format::Pdf | Format::Eps => finalize_print(spec, image, plan, options).await,
        Format::Emf => finalize_emf(spec, image).await,
    };
    match outcome {
        Ok(outcome) => State::Done(outcome),
        Err(err) => State::Failed(err),
    }
}

fn finalize_raster(spec: &ExportSpec, data: &str) -> Result<RenderOutcome, ExportError> {
    let data = data.trim();
    let result = if spec.encoded {
        if RASTER_URI_PREFIX.is_match(data) {
            ExportResult::Text(data.to_string())
        } else {
            ExportResult::Text(format!("data:{}{BASE64_PREFIX}{data}", spec.format.mime_type()))
        }
    } else {
        let stripped = RASTER_URI_PREFIX.replace(data, "");
        let bytes = STANDARD
            .decode(stripped.as_bytes())
            .map_err(|err| conversion_error(err.to_string()))?;
        ExportResult::Binary(bytes)
    };
    Ok(RenderOutcome::success(spec, Some(result)))
}

async fn finalize_rasterized(spec: &ExportSpec, data: &str) -> Result<RenderOutcome, ExportError> {
    let markup = decode_svg(data)?;
    let (width, height, scale) = (spec.width, spec.height, spec.scale);
    let png = tokio::task::spawn_blocking(move || rasterize_svg(&markup, width, height, scale))
        .await
        .map_err(|err| conversion_error(err.to_string()))?
        .map_err(|err| conversion_error(err.to_string()))?;

    let result = if spec.encoded {
        ExportResult::Text(format!(
            "data:{}{BASE64_PREFIX}{}",
            Format::Png.mime_type(),
            STANDARD.encode(&png)
        ))
    } else {
        ExportResult::Binary(png)
    };
    Ok(RenderOutcome::success(spec, Some(result)))
}

fn finalize_svg(spec: &ExportSpec, data: &str) -> Result<RenderOutcome, ExportError> {
    let result = if spec.encoded {
        if data.starts_with("data:image/svg+xml") {
            data.to_string()
        } else {
            format!(
                "data:{}{BASE64_PREFIX}{}",
                Format::Svg.mime_type(),
                STANDARD.encode(data)
            )
        }
    } else {
        decode_svg(data)?
    };
    Ok(RenderOutcome::success(spec, Some(ExportResult::Text(result))))
}

async fn finalize_print(
    spec: &ExportSpec,
    image: ImageData,
    plan: Plan,
    options: &ExporterOptions,
) -> Result<RenderOutcome, ExportError> {
    let background = image
        .background
        .or(plan.captured_background)
        .or_else(|| spec.payload.background().map(str::to_string))
        .unwrap_or_else(|| Rgb::WHITE.to_string());
    let markup = decode_svg(&image.data)?;

    let surface = DisplaySurface::new(spec.width, spec.height, spec.scale, background.clone());
    let page = surface
        .load(markup, options.pdf_load_timeout())
        .await
        .map_err(|err| ExportError::with_message(StatusCode::RendererError, err.to_string()))?;

    let mut outcome = RenderOutcome::success(spec, None);
    outcome.pdf_bg_color = Some(background);
    outcome.page = Some(page);
    Ok(outcome)
}

async fn finalize_emf(spec: &ExportSpec, image: ImageData) -> Result<RenderOutcome, ExportError> {
    let background = image
        .background
        .as_deref()
        .and_then(Rgb::parse)
        .unwrap_or_else(|| resolve_background(&spec.payload));
    let markup = decode_svg(&image.data)?;
    let cleaned = clean_vector(&markup, background)
        .await
        .map_err(|err| conversion_error(err.to_string()))?;
    Ok(RenderOutcome::success(spec, Some(ExportResult::Text(cleaned))))
}

/// Accepts raw markup, a percent-encoded `data:image/svg+xml,` URI or its
/// base64 variant.
fn decode_svg(data: &str) -> Result<String, ExportError> {
    if let Some(encoded) = data.strip_prefix(SVG_URI_PREFIX) {
        return percent_decode(encoded).map_err(conversion_error);
    }
    if let Some(rest) = data.strip_prefix("data:image/svg+xml") {
        let Some((_, encoded)) = rest.split_once(BASE64_PREFIX) else {
            return Err(conversion_error("unsupported svg data uri"));
        };
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| conversion_error(err.to_string()))?;
        return String::from_utf8(bytes).map_err(|err| conversion_error(err.to_string()));
    }
    Ok(data.to_string())
}

fn percent_decode(input: &str) -> Result<String, String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("malformed percent escape at byte {i}"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|err| err.to_string())
}
