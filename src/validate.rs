use crate::config::ExporterOptions;
use crate::error::ExportError;
use crate::format::{
    DEFAULT_CHART_FORMAT, DEFAULT_DIAGRAM_FORMAT, DEFAULT_HEIGHT, DEFAULT_SCALE, DEFAULT_WIDTH,
    Format, StatusCode,
};
use crate::request::{
    ChartRequest, Diagram, DiagramRequest, ExportRequest, ExportSpec, Figure, Payload,
    RequestOptions,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Normalizes a raw request into an [`ExportSpec`], stopping at the first failure.
pub fn validate(request: &ExportRequest, options: &ExporterOptions) -> Result<ExportSpec, ExportError> {
    match request {
        ExportRequest::Chart(chart) => validate_chart(chart),
        ExportRequest::Diagram(diagram) => validate_diagram(diagram, &options.diagram_config_keys),
    }
}

fn validate_chart(request: &ChartRequest) -> Result<ExportSpec, ExportError> {
    let Value::Object(figure) = &request.figure else {
        return Err(malformed("non-object figure"));
    };

    let data = present(figure.get("data"));
    let layout = present(figure.get("layout"));
    if data.is_none() && layout.is_none() {
        return Err(malformed("no 'data' and no 'layout' in figure"));
    }

    let data = match data {
        Some(Value::Array(traces)) => traces.clone(),
        Some(_) => return Err(malformed("non-array figure data")),
        None => Vec::new(),
    };
    let layout = match layout {
        Some(Value::Object(layout)) => layout.clone(),
        Some(_) => return Err(malformed("non-object figure layout")),
        None => Map::new(),
    };

    let mut config = match present(figure.get("config")) {
        Some(Value::Object(config)) => config.clone(),
        Some(_) => return Err(malformed("non-object figure config")),
        None => Map::new(),
    };
    match present(request.config.as_ref()) {
        Some(Value::Object(overrides)) => {
            config.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Some(_) => return Err(malformed("non-object figure config")),
        None => {}
    }

    let opts = &request.options;
    let format = resolve_format(opts, DEFAULT_CHART_FORMAT, StatusCode::NotAcceptable)?;
    let width = resolve_dimension(opts.width.as_ref(), &layout, "width", DEFAULT_WIDTH);
    let height = resolve_dimension(opts.height.as_ref(), &layout, "height", DEFAULT_HEIGHT);
    let scale = positive_number(opts.scale.as_ref()).unwrap_or(DEFAULT_SCALE);

    Ok(ExportSpec {
        format,
        width,
        height,
        scale,
        encoded: opts.encoded.as_ref().is_some_and(is_truthy),
        payload: Payload::Figure(Figure { data, layout }),
        config,
    })
}

fn validate_diagram(
    request: &DiagramRequest,
    accepted_keys: &BTreeSet<String>,
) -> Result<ExportSpec, ExportError> {
    let source = match &request.source {
        Value::String(text) if !text.trim().is_empty() => text.clone(),
        _ => return Err(malformed("empty markdown")),
    };

    let config = parse_config(request.config.as_ref())
        .ok_or_else(|| malformed("non-object diagram config"))?;
    let init_config = parse_config(request.init_config.as_ref())
        .ok_or_else(|| malformed("non-object mermaid config"))?;

    let opts = &request.options;
    let format = resolve_format(opts, DEFAULT_DIAGRAM_FORMAT, StatusCode::Malformed)?;
    let width = positive_number(opts.width.as_ref()).unwrap_or(DEFAULT_WIDTH);
    let height = positive_number(opts.height.as_ref()).unwrap_or(DEFAULT_HEIGHT);
    let scale = positive_number(opts.scale.as_ref()).unwrap_or(DEFAULT_SCALE);

    if !has_only_keys(&config, accepted_keys) {
        return Err(malformed("wrong diagram config parameters"));
    }
    if !has_only_keys(&init_config, accepted_keys) {
        return Err(malformed("wrong mermaid config parameters"));
    }

    Ok(ExportSpec {
        format,
        width,
        height,
        scale,
        encoded: opts.encoded.as_ref().is_some_and(is_truthy),
        payload: Payload::Diagram(Diagram {
            source,
            init_config,
        }),
        config,
    })
}

fn malformed(extra: &str) -> ExportError {
    ExportError::with_extra(StatusCode::Malformed, extra)
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|value| !value.is_null())
}

fn resolve_format(
    opts: &RequestOptions,
    default: Format,
    unknown: StatusCode,
) -> Result<Format, ExportError> {
    match opts.format.as_ref().and_then(Value::as_str) {
        Some(name) if !name.is_empty() => {
            Format::from_name(name).ok_or_else(|| ExportError::with_extra(unknown, "wrong format"))
        }
        _ => Ok(default),
    }
}

/// Request value, then the layout's own value unless the layout autosizes,
/// then the template layout, then the registry default.
fn resolve_dimension(
    requested: Option<&Value>,
    layout: &Map<String, Value>,
    key: &str,
    default: f64,
) -> f64 {
    if let Some(value) = positive_number(requested) {
        return value;
    }
    if layout.get("autosize").is_some_and(is_truthy) {
        return default;
    }
    positive_number(layout.get(key))
        .or_else(|| {
            let template_layout = layout.get("template")?.get("layout")?;
            positive_number(template_layout.get(key))
        })
        .unwrap_or(default)
}

/// Numbers and numeric strings that are finite and strictly positive.
pub(crate) fn positive_number(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (number.is_finite() && number > 0.0).then_some(number)
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Accepts an object or JSON text (possibly encoded more than once).
/// Absent, null and blank values mean an empty config.
fn parse_config(value: Option<&Value>) -> Option<Map<String, Value>> {
    let mut current = match value {
        None | Some(Value::Null) => return Some(Map::new()),
        Some(value) => value.clone(),
    };
    loop {
        match current {
            Value::Object(map) => return Some(map),
            Value::String(text) if text.trim().is_empty() => return Some(Map::new()),
            Value::String(text) => current = json5::from_str::<Value>(&text).ok()?,
            _ => return None,
        }
    }
}

fn has_only_keys(config: &Map<String, Value>, accepted: &BTreeSet<String>) -> bool {
    config.keys().all(|key| accepted.contains(key))
}
