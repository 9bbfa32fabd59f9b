//! A small owned tree for SVG documents: parse with quick-xml, rebuild with
//! pure transforms, serialize back to markup.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SvgError {
    #[error("malformed svg at byte {position}: {message}")]
    Syntax { position: u64, message: String },
    #[error("unexpected closing tag </{0}>")]
    UnexpectedEnd(String),
    #[error("mismatched closing tag: expected </{expected}>, found </{found}>")]
    MismatchedEnd { expected: String, found: String },
    #[error("unclosed element <{0}>")]
    Unclosed(String),
    #[error("document has no root element")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    /// Text kept verbatim because it could not be unescaped.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub root: Element,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(name, _)| name == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    /// A presentation property, looked up in the inline style first and then
    /// in the attribute of the same name.
    pub fn paint(&self, property: &str) -> Option<String> {
        self.attr("style")
            .and_then(|style| style_value(style, property))
            .map(str::to_string)
            .or_else(|| self.attr(property).map(|value| value.trim().to_string()))
    }

    /// Sets a property inside the inline style, dropping any attribute of the
    /// same name so the two cannot disagree.
    pub fn set_paint(&mut self, property: &str, value: &str) {
        let style = self.attr("style").unwrap_or_default();
        let updated = set_style_value(style, property, value);
        self.set_attr("style", updated);
        self.attributes.retain(|(name, _)| name != property);
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Depth-first walk over this element and every descendant element.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Element)) {
        visit(self);
        for child in self.child_elements() {
            child.walk(visit);
        }
    }

    /// Rebuilds the subtree bottom-up. `rule` sees each element after its
    /// children were rebuilt and returns `None` to drop it.
    pub fn rebuild(self, rule: &mut impl FnMut(Element) -> Option<Element>) -> Option<Element> {
        let Element {
            name,
            attributes,
            children,
        } = self;
        let children = children
            .into_iter()
            .filter_map(|node| match node {
                Node::Element(element) => element.rebuild(rule).map(Node::Element),
                other => Some(other),
            })
            .collect();
        rule(Element {
            name,
            attributes,
            children,
        })
    }
}

impl Document {
    pub fn parse(markup: &str) -> Result<Self, SvgError> {
        let mut reader = Reader::from_str(markup);
        reader.config_mut().trim_text_start = false;
        reader.config_mut().trim_text_end = false;
        reader.config_mut().check_end_names = false;

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|err| SvgError::Syntax {
                position: reader.error_position(),
                message: err.to_string(),
            })?;
            match event {
                Event::Start(start) => stack.push(open_element(&start)),
                Event::Empty(start) => {
                    let element = open_element(&start);
                    attach(&mut stack, &mut root, element);
                }
                Event::End(end) => {
                    let found = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    let element = stack
                        .pop()
                        .ok_or_else(|| SvgError::UnexpectedEnd(found.clone()))?;
                    if element.name != found {
                        return Err(SvgError::MismatchedEnd {
                            expected: element.name,
                            found,
                        });
                    }
                    attach(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let node = match text.unescape() {
                            Ok(value) => Node::Text(value.into_owned()),
                            Err(_) => Node::Raw(String::from_utf8_lossy(&text).into_owned()),
                        };
                        parent.children.push(node);
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .children
                            .push(Node::CData(String::from_utf8_lossy(&data).into_owned()));
                    }
                }
                Event::Comment(comment) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .children
                            .push(Node::Comment(String::from_utf8_lossy(&comment).into_owned()));
                    }
                }
                Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if let Some(open) = stack.pop() {
            return Err(SvgError::Unclosed(open.name));
        }
        root.map(|root| Document { root }).ok_or(SvgError::Empty)
    }

    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        write_element(&self.root, &mut out);
        out
    }

    /// Applies `rule` to every element. Dropping the root leaves it untouched.
    pub fn rebuild(self, mut rule: impl FnMut(Element) -> Option<Element>) -> Self {
        let fallback = self.root.clone();
        Document {
            root: self.root.rebuild(&mut rule).unwrap_or(fallback),
        }
    }
}

fn open_element(start: &BytesStart<'_>) -> Element {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let attributes = start
        .attributes()
        .with_checks(false)
        .filter_map(Result::ok)
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = match attr.unescape_value() {
                Ok(value) => value.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            (key, value)
        })
        .collect();
    Element {
        name,
        attributes,
        children: Vec::new(),
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

fn write_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for (key, value) in &element.attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    if element.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &element.children {
        match child {
            Node::Element(child) => write_element(child, out),
            Node::Text(text) => out.push_str(&escape_text(text)),
            Node::CData(data) => {
                out.push_str("<![CDATA[");
                out.push_str(data);
                out.push_str("]]>");
            }
            Node::Comment(comment) => {
                out.push_str("<!--");
                out.push_str(comment);
                out.push_str("-->");
            }
            Node::Raw(raw) => out.push_str(raw),
        }
    }
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

fn escape_text(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(input: &str) -> String {
    escape_text(input).replace('"', "&quot;")
}

/// Value of `property` in a CSS declaration list such as `fill: red; fill-opacity: 0`.
pub fn style_value<'a>(style: &'a str, property: &str) -> Option<&'a str> {
    style
        .split(';')
        .filter_map(|decl| decl.split_once(':'))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case(property))
        .map(|(_, value)| value.trim())
        .last()
}

pub fn set_style_value(style: &str, property: &str, value: &str) -> String {
    let mut decls: Vec<String> = Vec::new();
    let mut replaced = false;
    for decl in style.split(';') {
        let decl = decl.trim();
        if decl.is_empty() {
            continue;
        }
        match decl.split_once(':') {
            Some((name, _)) if name.trim().eq_ignore_ascii_case(property) => {
                if !replaced {
                    decls.push(format!("{property}: {value}"));
                    replaced = true;
                }
            }
            _ => decls.push(decl.to_string()),
        }
    }
    if !replaced {
        decls.push(format!("{property}: {value}"));
    }
    let mut out = decls.join("; ");
    out.push(';');
    out
}
