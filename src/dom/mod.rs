//! In-memory element tree
//!
//! A minimal DOM for hosting playground widgets: elements with a tag,
//! attributes, a class list, a text run, a `disabled` flag, children and
//! click listeners. Elements are shared handles (`Rc<RefCell<..>>`), so a
//! clone refers to the same node, exactly like a JS element reference.
//!
//! Lookup follows `querySelector` semantics over a small selector grammar:
//! tag, `.class`, `#id`, `[attr]`, `[attr=value]`, descendant combinator
//! (whitespace) and comma separated selector lists.
//!
//! ```
//! use kernel_playground::dom::{self, Element};
//!
//! let widget = Element::new("div")
//!     .with_class("Playground")
//!     .with_child(Element::new("button").with_class("Playground-Run"));
//! let button = dom::find_required(&widget, ".Playground-Run").unwrap();
//! assert_eq!(button.tag(), "button");
//! ```

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

type Listener = Rc<dyn Fn()>;

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    classes: Vec<String>,
    text: String,
    disabled: bool,
    children: Vec<Element>,
    listeners: Vec<Listener>,
}

/// Shared handle to one element node.
#[derive(Clone)]
pub struct Element(Rc<RefCell<Node>>);

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.0.borrow();
        f.debug_struct("Element")
            .field("tag", &node.tag)
            .field("classes", &node.classes)
            .field("attributes", &node.attributes)
            .field("children", &node.children.len())
            .finish()
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Element {}

impl Element {
    /// Create a detached element with the given tag name.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(Rc::new(RefCell::new(Node {
            tag: tag.into().to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            classes: Vec::new(),
            text: String::new(),
            disabled: false,
            children: Vec::new(),
            listeners: Vec::new(),
        })))
    }

    // -- builders -----------------------------------------------------------

    pub fn with_class(self, class: impl Into<String>) -> Self {
        self.add_class(class);
        self
    }

    pub fn with_attribute(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    pub fn with_child(self, child: Element) -> Self {
        self.append_child(child);
        self
    }

    // -- identity / attributes ----------------------------------------------

    pub fn tag(&self) -> String {
        self.0.borrow().tag.clone()
    }

    /// Value of an attribute. `class` is answered from the class list.
    pub fn attribute(&self, name: &str) -> Option<String> {
        let node = self.0.borrow();
        if name == "class" {
            return if node.classes.is_empty() {
                None
            } else {
                Some(node.classes.join(" "))
            };
        }
        node.attributes.get(name).cloned()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if name == "class" {
            let mut node = self.0.borrow_mut();
            node.classes = value.split_whitespace().map(str::to_string).collect();
            return;
        }
        self.0.borrow_mut().attributes.insert(name, value);
    }

    pub fn remove_attribute(&self, name: &str) {
        if name == "class" {
            self.0.borrow_mut().classes.clear();
        } else {
            self.0.borrow_mut().attributes.remove(name);
        }
    }

    /// Read a `data-<key>` attribute (the `dataset` view).
    pub fn data(&self, key: &str) -> Option<String> {
        self.attribute(&format!("data-{}", key))
    }

    pub fn id(&self) -> Option<String> {
        self.attribute("id")
    }

    // -- classes ------------------------------------------------------------

    pub fn has_class(&self, class: &str) -> bool {
        self.0.borrow().classes.iter().any(|c| c == class)
    }

    pub fn add_class(&self, class: impl Into<String>) {
        let class = class.into();
        let mut node = self.0.borrow_mut();
        if !node.classes.contains(&class) {
            node.classes.push(class);
        }
    }

    pub fn remove_class(&self, class: &str) {
        self.0.borrow_mut().classes.retain(|c| c != class);
    }

    /// Add the class when `force` is true, remove it otherwise.
    pub fn toggle_class(&self, class: &str, force: bool) {
        if force {
            self.add_class(class);
        } else {
            self.remove_class(class);
        }
    }

    pub fn classes(&self) -> Vec<String> {
        self.0.borrow().classes.clone()
    }

    // -- text ---------------------------------------------------------------

    /// The element's own text run (children excluded).
    pub fn text(&self) -> String {
        self.0.borrow().text.clone()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        self.0.borrow_mut().text = text.into();
    }

    pub fn append_text(&self, text: &str) {
        self.0.borrow_mut().text.push_str(text);
    }

    /// Own text followed by the text of every descendant, in document order.
    pub fn text_content(&self) -> String {
        let mut out = self.text();
        for child in self.children() {
            out.push_str(&child.text_content());
        }
        out
    }

    // -- controls -----------------------------------------------------------

    pub fn is_disabled(&self) -> bool {
        self.0.borrow().disabled
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.0.borrow_mut().disabled = disabled;
    }

    pub fn add_click_listener(&self, listener: impl Fn() + 'static) {
        self.0.borrow_mut().listeners.push(Rc::new(listener));
    }

    /// Fire click listeners. A disabled element swallows the click.
    pub fn click(&self) {
        let listeners = {
            let node = self.0.borrow();
            if node.disabled {
                return;
            }
            node.listeners.clone()
        };
        for listener in listeners {
            listener();
        }
    }

    // -- tree ---------------------------------------------------------------

    pub fn append_child(&self, child: Element) {
        self.0.borrow_mut().children.push(child);
    }

    pub fn children(&self) -> Vec<Element> {
        self.0.borrow().children.clone()
    }

    /// First descendant matching `selector`, in document order.
    pub fn query_selector(&self, selector: &Selector) -> Option<Element> {
        let mut found = Vec::new();
        let mut ancestors = vec![self.clone()];
        walk(self, selector, &mut ancestors, &mut found, true);
        found.into_iter().next()
    }

    /// Every descendant matching `selector`, in document order.
    pub fn query_selector_all(&self, selector: &Selector) -> Vec<Element> {
        let mut found = Vec::new();
        let mut ancestors = vec![self.clone()];
        walk(self, selector, &mut ancestors, &mut found, false);
        found
    }

    // -- rendering ----------------------------------------------------------

    /// Render this element and its subtree as indented markup.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_html(&mut out, 0);
        out
    }

    fn write_html(&self, out: &mut String, depth: usize) {
        let node = self.0.borrow();
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        out.push('<');
        out.push_str(&node.tag);
        if !node.classes.is_empty() {
            out.push_str(&format!(" class=\"{}\"", escape(&node.classes.join(" "), true)));
        }
        for (name, value) in &node.attributes {
            out.push_str(&format!(" {}=\"{}\"", name, escape(value, true)));
        }
        if node.disabled {
            out.push_str(" disabled");
        }
        out.push('>');
        out.push_str(&escape(&node.text, false));
        if node.children.is_empty() {
            out.push_str(&format!("</{}>\n", node.tag));
            return;
        }
        out.push('\n');
        for child in &node.children {
            child.write_html(out, depth + 1);
        }
        out.push_str(&format!("{}</{}>\n", indent, node.tag));
    }
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Depth-first, pre-order walk. Returns `true` once the search may stop.
fn walk(
    element: &Element,
    selector: &Selector,
    ancestors: &mut Vec<Element>,
    found: &mut Vec<Element>,
    first_only: bool,
) -> bool {
    for child in element.children() {
        if selector.matches(&child, ancestors) {
            found.push(child.clone());
            if first_only {
                return true;
            }
        }
        ancestors.push(child.clone());
        let done = walk(&child, selector, ancestors, found, first_only);
        ancestors.pop();
        if done {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A page: a `body` element that widgets are attached to.
#[derive(Debug, Clone)]
pub struct Document {
    body: Element,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            body: Element::new("body"),
        }
    }

    pub fn body(&self) -> &Element {
        &self.body
    }

    pub fn to_html(&self) -> String {
        self.body.to_html()
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<(String, Option<String>)>,
}

impl Compound {
    fn matches(&self, element: &Element) -> bool {
        let node = element.0.borrow();
        if let Some(tag) = &self.tag {
            if &node.tag != tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.attributes.get("id") != Some(id) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| node.classes.contains(c)) {
            return false;
        }
        self.attributes.iter().all(|(name, expected)| {
            let actual = if name == "class" {
                (!node.classes.is_empty()).then(|| node.classes.join(" "))
            } else {
                node.attributes.get(name).cloned()
            };
            match (actual, expected) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => &actual == expected,
            }
        })
    }
}

/// A parsed selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    /// Each alternative is a chain of compounds joined by the descendant
    /// combinator, outermost first.
    alternatives: Vec<Vec<Compound>>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = SelectorParser {
            source,
            chars: source.chars().collect(),
            pos: 0,
        };
        let alternatives = parser.parse_list()?;
        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `ancestors` runs from the search root down to the element's parent.
    fn matches(&self, element: &Element, ancestors: &[Element]) -> bool {
        self.alternatives
            .iter()
            .any(|chain| matches_chain(chain, element, ancestors))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn matches_chain(chain: &[Compound], element: &Element, ancestors: &[Element]) -> bool {
    let Some((subject, mut remaining)) = chain.split_last() else {
        return false;
    };
    if !subject.matches(element) {
        return false;
    }
    // Descendant-only chains can be matched greedily from the nearest ancestor.
    for ancestor in ancestors.iter().rev() {
        match remaining.split_last() {
            None => break,
            Some((compound, rest)) => {
                if compound.matches(ancestor) {
                    remaining = rest;
                }
            }
        }
    }
    remaining.is_empty()
}

struct SelectorParser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl SelectorParser<'_> {
    fn error(&self, reason: impl Into<String>) -> Error {
        Error::invalid_selector(self.source, reason)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn parse_list(&mut self) -> Result<Vec<Vec<Compound>>> {
        let mut list = Vec::new();
        loop {
            list.push(self.parse_chain()?);
            match self.peek() {
                None => return Ok(list),
                Some(',') => self.pos += 1,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            }
        }
    }

    fn parse_chain(&mut self) -> Result<Vec<Compound>> {
        let mut chain = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None | Some(',') => break,
                _ => chain.push(self.parse_compound()?),
            }
        }
        if chain.is_empty() {
            return Err(self.error("empty selector"));
        }
        Ok(chain)
    }

    fn parse_compound(&mut self) -> Result<Compound> {
        let start = self.pos;
        let mut compound = Compound::default();
        match self.peek() {
            Some('*') => self.pos += 1,
            Some(c) if is_ident_char(c) => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attributes.push(self.attribute()?);
                }
                _ => break,
            }
        }
        if self.pos == start {
            let found = self.peek().map(String::from).unwrap_or_default();
            return Err(self.error(format!("unexpected '{}'", found)));
        }
        Ok(compound)
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error(format!("expected a name at offset {}", start)));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn attribute(&mut self) -> Result<(String, Option<String>)> {
        self.skip_whitespace();
        let name = self.ident()?;
        self.skip_whitespace();
        let value = match self.peek() {
            Some(']') => None,
            Some('=') => {
                self.pos += 1;
                self.skip_whitespace();
                let value = match self.peek() {
                    Some(quote @ ('"' | '\'')) => self.quoted(quote)?,
                    _ => self.ident()?,
                };
                self.skip_whitespace();
                Some(value)
            }
            _ => return Err(self.error(format!("malformed attribute selector [{}", name))),
        };
        if self.peek() != Some(']') {
            return Err(self.error("missing ']'"));
        }
        self.pos += 1;
        Ok((name, value))
    }

    fn quoted(&mut self, quote: char) -> Result<String> {
        self.pos += 1; // opening quote
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let value = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                return Ok(value);
            }
            self.pos += 1;
        }
        Err(self.error("unterminated string"))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

/// First descendant of `container` matching `selector`.
///
/// A missing element is an integrity error of the page, reported as
/// `<selector> is not found.`.
pub fn find_required(container: &Element, selector: &str) -> Result<Element> {
    let parsed = Selector::parse(selector)?;
    container
        .query_selector(&parsed)
        .ok_or_else(|| Error::element_not_found(selector))
}

/// Every descendant of `container` matching `selector`; empty when nothing
/// matches. A selector that does not parse matches nothing.
pub fn find_all(container: &Element, selector: &str) -> Vec<Element> {
    match Selector::parse(selector) {
        Ok(parsed) => container.query_selector_all(&parsed),
        Err(err) => {
            debug!(%err, "find_all: selector matches nothing");
            Vec::new()
        }
    }
}

/// Descendant of `container` whose `id` attribute equals `id`.
pub fn find_by_id(container: &Element, id: &str) -> Result<Element> {
    let selector = format!("#{}", id);
    let parsed = Selector::parse(&selector)?;
    container
        .query_selector(&parsed)
        .ok_or_else(|| Error::element_not_found(selector))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
