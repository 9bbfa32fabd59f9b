use crate::format::Format;
use serde::Serialize;
use serde_json::{Map, Value};

/// Which validator a raw request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chart,
    Diagram,
}

/// Untrusted request as received from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportRequest {
    Chart(ChartRequest),
    Diagram(DiagramRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartRequest {
    pub figure: Value,
    pub config: Option<Value>,
    pub options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagramRequest {
    pub source: Value,
    pub config: Option<Value>,
    pub init_config: Option<Value>,
    pub options: RequestOptions,
}

/// Export options exactly as supplied; nothing here is checked yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub format: Option<Value>,
    pub width: Option<Value>,
    pub height: Option<Value>,
    pub scale: Option<Value>,
    pub encoded: Option<Value>,
}

impl RequestOptions {
    fn from_object(object: &Map<String, Value>) -> Self {
        Self {
            format: object.get("format").cloned(),
            width: object.get("width").cloned(),
            height: object.get("height").cloned(),
            scale: object.get("scale").cloned(),
            encoded: object.get("encoded").cloned(),
        }
    }
}

impl ExportRequest {
    /// Routes a raw body to a request kind.
    ///
    /// A `figure` key selects the chart path with options read from the body.
    /// A string `data` (or a `diagram` key) selects the diagram path. Anything
    /// else is treated as a bare `{data, layout}` figure.
    pub fn from_value(body: Value) -> Self {
        let kind = match &body {
            Value::Object(object)
                if !object.contains_key("figure")
                    && (object.contains_key("diagram")
                        || object.get("data").is_some_and(Value::is_string)) =>
            {
                RequestKind::Diagram
            }
            _ => RequestKind::Chart,
        };
        Self::with_kind(body, kind)
    }

    pub fn with_kind(body: Value, kind: RequestKind) -> Self {
        match kind {
            RequestKind::Chart => ExportRequest::Chart(ChartRequest::from_body(body)),
            RequestKind::Diagram => ExportRequest::Diagram(DiagramRequest::from_body(body)),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            ExportRequest::Chart(_) => RequestKind::Chart,
            ExportRequest::Diagram(_) => RequestKind::Diagram,
        }
    }

    pub fn options(&self) -> &RequestOptions {
        match self {
            ExportRequest::Chart(request) => &request.options,
            ExportRequest::Diagram(request) => &request.options,
        }
    }
}

impl ChartRequest {
    fn from_body(body: Value) -> Self {
        let Value::Object(mut object) = body else {
            return Self {
                figure: body,
                config: None,
                options: RequestOptions::default(),
            };
        };

        let options = RequestOptions::from_object(&object);
        if let Some(figure) = object.remove("figure") {
            return Self {
                figure,
                config: object.remove("config"),
                options,
            };
        }

        let config = object.remove("config");
        let mut figure = Map::new();
        for key in ["data", "layout"] {
            if let Some(value) = object.remove(key) {
                figure.insert(key.to_string(), value);
            }
        }
        Self {
            figure: Value::Object(figure),
            config,
            options,
        }
    }
}

impl DiagramRequest {
    fn from_body(body: Value) -> Self {
        let Value::Object(mut object) = body else {
            return Self {
                source: body,
                config: None,
                init_config: None,
                options: RequestOptions::default(),
            };
        };

        let options = RequestOptions::from_object(&object);
        let source = object
            .remove("diagram")
            .or_else(|| object.remove("data"))
            .unwrap_or(Value::Null);
        Self {
            source,
            config: object.remove("config"),
            init_config: object.remove("mermaidConfig"),
            options,
        }
    }
}

/// A validated request. Every field is in its declared domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSpec {
    pub format: Format,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
    pub encoded: bool,
    pub payload: Payload,
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Figure(Figure),
    Diagram(Diagram),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Figure {
    pub data: Vec<Value>,
    pub layout: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagram {
    pub source: String,
    pub init_config: Map<String, Value>,
}

impl ExportSpec {
    pub fn figure(&self) -> Option<&Figure> {
        match &self.payload {
            Payload::Figure(figure) => Some(figure),
            Payload::Diagram(_) => None,
        }
    }
}

impl Figure {
    /// `layout.paper_bgcolor`, falling back to the template's layout.
    pub fn paper_background(&self) -> Option<&str> {
        self.layout
            .get("paper_bgcolor")
            .and_then(Value::as_str)
            .or_else(|| {
                self.layout
                    .get("template")
                    .and_then(|template| template.get("layout"))
                    .and_then(|layout| layout.get("paper_bgcolor"))
                    .and_then(Value::as_str)
            })
    }

    /// The layout title text, whether given as a string or as `{text: ...}`.
    pub fn title(&self) -> Option<&str> {
        match self.layout.get("title")? {
            Value::String(text) => Some(text),
            Value::Object(title) => title.get("text").and_then(Value::as_str),
            _ => None,
        }
    }
}

impl Diagram {
    /// Theme background from the initialization config, when one is set.
    pub fn background(&self) -> Option<&str> {
        self.init_config
            .get("themeVariables")
            .and_then(|vars| vars.get("background"))
            .and_then(Value::as_str)
    }
}

impl Payload {
    pub fn background(&self) -> Option<&str> {
        match self {
            Payload::Figure(figure) => figure.paper_background(),
            Payload::Diagram(diagram) => diagram.background(),
        }
    }
}
