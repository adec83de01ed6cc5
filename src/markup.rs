//! Markup reading and narrative text extraction.
//!
//! EPUB fragments are XHTML in theory and tag soup in practice, so the reader
//! here never fails: unknown constructs become text, stray closing tags are
//! ignored and unclosed elements are closed at the end of input. Every element
//! keeps the byte span of its source so callers can slice the original markup
//! (the chapter segmenter splits fragments that way).
//!
//! [`MarkupExtractor`] walks the tree and emits a flat run stream in which
//! non-narrative structures (notes, navigation, tables, indexes, ...) have
//! already been removed.

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Elements whose whole subtree is never narrated.
pub const NON_NARRATIVE_TAGS: &[&str] = &[
    "script", "style", "nav", "aside", "footer", "header", "figcaption", "figure", "table",
    "svg", "math", "code", "pre", "sup", "sub", "noscript", "iframe", "object", "embed",
    "canvas", "form", "input", "select", "textarea", "button", "map", "area",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "blockquote", "section", "article", "body", "dd", "dt", "ol", "ul",
];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Class/id keywords marking editorial apparatus rather than narrative.
const NOISE_KEYWORDS: &[&str] = &[
    // notes
    "footnote", "footnotes", "endnote", "endnotes", "note", "notes", "noteref", "noterefs",
    "fn", "fnref",
    // page furniture
    "pagenum", "page-number", "pageno", "page-break", "running-head",
    // table of contents
    "toc", "table-of-contents", "contents", "calibre_toc", "toc-entry", "toc-item", "toc-link",
    "toc-list",
    // analytic index
    "index", "index-entry", "index-item", "index-group", "book-index", "subject-index",
    "name-index",
    // bibliography
    "bibliography", "references", "biblio", "bib-entry", "citation", "citations",
    "works-cited", "further-reading", "ref-list", "reference-list", "sources",
    // sidebars
    "sidebar", "pullquote", "infobox", "textbox", "tip", "warning",
    // copyright
    "copyright", "colophon", "imprint", "legal",
    // glossary
    "glossary", "glossary-entry", "glossary-term", "glossary-def",
    // editorial
    "appendix-notes", "editorial-note", "editors-note", "translator-note", "pub-info",
    "book-info",
];

const NOISE_ROLES: &[&str] = &[
    "navigation", "complementary", "contentinfo", "note", "directory", "doc-bibliography",
    "doc-endnotes", "doc-glossary", "doc-index", "doc-toc",
];

/// EPUB 3 semantic inflections (`epub:type`) that are not narrated.
pub const NON_NARRATIVE_EPUB_TYPES: &[&str] = &[
    "footnote", "footnotes", "endnote", "endnotes", "noteref", "annotation", "rearnote",
    "rearnotes", "bibliography", "biblioentry", "glossary", "glossterm", "glossdef", "index",
    "index-headnotes", "index-group", "index-entry", "index-term", "index-locator", "toc",
    "landmarks", "lot", "loi", "loa", "colophon", "imprint", "copyright-page", "errata",
    "appendix", "contributors", "other-credits", "acknowledgments",
];

/// Anchor-name prefixes of footnote and reference links.
const NOTE_ANCHOR_PREFIXES: &[&str] = &[
    "note", "fn", "endnote", "footnote", "ref", "bib", "cite", "annot", "en-", "sdfootnote",
    "_ftn", "_edn",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
    /// Byte offset of the opening tag.
    pub start: usize,
    /// Byte offset just past the closing tag.
    pub end: usize,
}

impl Element {
    fn new(name: impl Into<String>, attrs: Vec<(String, String)>, start: usize, end: usize) -> Self {
        Self {
            name: name.into(),
            attrs,
            children: Vec::new(),
            start,
            end,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `1..=6` for `h1`..`h6`.
    pub fn heading_level(&self) -> Option<u8> {
        let bytes = self.name.as_bytes();
        if bytes.len() == 2 && bytes[0] == b'h' && (b'1'..=b'6').contains(&bytes[1]) {
            Some(bytes[1] - b'0')
        } else {
            None
        }
    }

    /// All descendant text, whitespace collapsed.
    pub fn text(&self) -> String {
        let mut raw = String::new();
        collect_text(self, &mut raw);
        collapse_whitespace(&raw)
    }

    /// Every descendant with the given tag name, in document order.
    pub fn find_all(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        for child in &self.children {
            if let Node::Element(el) = child {
                if el.name == name {
                    found.push(el);
                }
                found.extend(el.find_all(name));
            }
        }
        found
    }

    /// First descendant (depth-first, document order) with the given tag name.
    pub fn find_first(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if let Node::Element(el) = child {
                if el.name == name {
                    return Some(el);
                }
                if let Some(found) = el.find_first(name) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn has_element_children(&self) -> bool {
        self.children.iter().any(|c| matches!(c, Node::Element(_)))
    }
}

fn collect_text(el: &Element, out: &mut String) {
    for child in &el.children {
        match child {
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            Node::Element(inner) => collect_text(inner, out),
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn token_regex() -> &'static Regex {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    TOKEN_RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<!--.*?-->|<!\[CDATA\[(.*?)\]\]>|<![^>]*>|<\?.*?\?>|<(/)?([A-Za-z][A-Za-z0-9:._-]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#,
        )
        .unwrap()
    })
}

fn attr_regex() -> &'static Regex {
    static ATTR_RE: OnceLock<Regex> = OnceLock::new();
    ATTR_RE.get_or_init(|| {
        Regex::new(r#"([^\s=/>"']+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#).unwrap()
    })
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    attr_regex()
        .captures_iter(raw)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| html_escape::decode_html_entities(m.as_str()).into_owned())
                .unwrap_or_default();
            Some((name, value))
        })
        .collect()
}

/// Parse markup into a tree rooted at a synthetic `#document` element.
///
/// Never fails; malformed input degrades to a flatter tree.
pub fn parse(html: &str) -> Element {
    let mut stack = vec![Element::new("#document", Vec::new(), 0, html.len())];
    let mut pos = 0;

    while pos < html.len() {
        let Some(caps) = token_regex().captures_at(html, pos) else {
            push_text(&mut stack, &html[pos..]);
            break;
        };
        let Some(whole) = caps.get(0) else { break };
        push_text(&mut stack, &html[pos..whole.start()]);
        pos = whole.end();

        if let Some(cdata) = caps.get(1) {
            push_text(&mut stack, cdata.as_str());
            continue;
        }
        let Some(name) = caps.get(3) else {
            // comment, doctype or processing instruction
            continue;
        };
        let name = name.as_str().to_ascii_lowercase();

        if caps.get(2).is_some() {
            close_element(&mut stack, &name, whole.start(), whole.end());
            continue;
        }

        let raw_attrs = caps.get(4).map(|m| m.as_str()).unwrap_or("");
        let self_closing =
            raw_attrs.trim_end().ends_with('/') || VOID_TAGS.contains(&name.as_str());
        let mut element = Element::new(
            name.clone(),
            parse_attrs(raw_attrs.trim_end().trim_end_matches('/')),
            whole.start(),
            whole.end(),
        );

        if self_closing {
            attach(&mut stack, element);
        } else if name == "script" || name == "style" {
            // Raw text: everything up to the matching close tag.
            let closing = format!("</{}", name);
            let rest = html[pos..].to_ascii_lowercase();
            let (content_end, next) = match rest.find(&closing) {
                Some(offset) => {
                    let close_start = pos + offset;
                    let close_end = html[close_start..]
                        .find('>')
                        .map(|i| close_start + i + 1)
                        .unwrap_or(html.len());
                    (close_start, close_end)
                }
                None => (html.len(), html.len()),
            };
            element
                .children
                .push(Node::Text(html[pos..content_end].to_string()));
            element.end = next;
            attach(&mut stack, element);
            pos = next;
        } else {
            stack.push(element);
        }
    }

    while stack.len() > 1 {
        if let Some(mut open) = stack.pop() {
            open.end = html.len();
            attach(&mut stack, open);
        }
    }
    stack.pop().unwrap_or_else(|| Element::new("#document", Vec::new(), 0, html.len()))
}

fn push_text(stack: &mut [Element], raw: &str) {
    if raw.is_empty() {
        return;
    }
    if let Some(top) = stack.last_mut() {
        let decoded = html_escape::decode_html_entities(raw).into_owned();
        top.children.push(Node::Text(decoded));
    }
}

fn attach(stack: &mut [Element], element: Element) {
    if let Some(top) = stack.last_mut() {
        top.children.push(Node::Element(element));
    }
}

fn close_element(stack: &mut Vec<Element>, name: &str, tag_start: usize, tag_end: usize) {
    // The synthetic root at index 0 is never closed.
    let Some(depth) = stack.iter().skip(1).rposition(|el| el.name == name) else {
        return;
    };
    let target = depth + 1;
    while stack.len() > target + 1 {
        if let Some(mut unclosed) = stack.pop() {
            unclosed.end = tag_start;
            attach(stack, unclosed);
        }
    }
    if let Some(mut closed) = stack.pop() {
        closed.end = tag_end;
        attach(stack, closed);
    }
}

/// Heading elements in document order, ignoring non-narrative subtrees.
pub fn headings(root: &Element) -> Vec<&Element> {
    fn visit<'a>(el: &'a Element, out: &mut Vec<&'a Element>) {
        for child in &el.children {
            if let Node::Element(inner) = child {
                if NON_NARRATIVE_TAGS.contains(&inner.name.as_str()) {
                    continue;
                }
                if inner.heading_level().is_some() {
                    out.push(inner);
                } else {
                    visit(inner, out);
                }
            }
        }
    }
    let mut out = Vec::new();
    visit(root, &mut out);
    out
}

/// `true` when `keyword` occurs in `haystack` delimited by non-letters.
pub fn contains_keyword(haystack: &str, keyword: &str) -> bool {
    haystack.match_indices(keyword).any(|(at, _)| {
        let before = haystack[..at].chars().next_back();
        let after = haystack[at + keyword.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphabetic()) && !after.is_some_and(|c| c.is_alphabetic())
    })
}

/// Whether a whitespace-separated `epub:type` or `properties` value names a
/// non-narrative type. Prefixed tokens (`z3998:index`) match on the suffix.
pub fn epub_type_matches(value: &str) -> bool {
    value.split_whitespace().any(|token| {
        let token = token.to_lowercase();
        let short = token.split_once(':').map(|(_, s)| s.to_string());
        NON_NARRATIVE_EPUB_TYPES.contains(&token.as_str())
            || short.is_some_and(|s| NON_NARRATIVE_EPUB_TYPES.contains(&s.as_str()))
    })
}

/// Whether an element's whole subtree should be dropped.
pub fn is_noise_element(el: &Element) -> bool {
    if NON_NARRATIVE_TAGS.contains(&el.name.as_str()) {
        return true;
    }

    if let Some(classes) = el.attr("class") {
        let noisy = classes.split_whitespace().any(|class| {
            let class = class.to_lowercase();
            NOISE_KEYWORDS.iter().any(|kw| contains_keyword(&class, kw))
        });
        if noisy {
            return true;
        }
    }

    if let Some(id) = el.attr("id") {
        let id = id.to_lowercase();
        if NOISE_KEYWORDS.iter().any(|kw| contains_keyword(&id, kw)) {
            return true;
        }
    }

    if let Some(role) = el.attr("role") {
        if NOISE_ROLES.contains(&role.trim().to_lowercase().as_str()) {
            return true;
        }
    }

    el.attr("epub:type").is_some_and(epub_type_matches)
}

fn is_note_link(el: &Element) -> bool {
    if let Some(href) = el.attr("href") {
        let href = href.to_lowercase();
        if let Some((_, anchor)) = href.split_once('#') {
            if NOTE_ANCHOR_PREFIXES.iter().any(|p| anchor.starts_with(p)) {
                return true;
            }
        }
    }
    if el
        .attr("epub:type")
        .is_some_and(|t| t.to_lowercase().contains("noteref"))
    {
        return true;
    }
    let text = el.text();
    (1..=3).contains(&text.len()) && text.bytes().all(|b| b.is_ascii_digit())
}

/// One piece of the flattened text stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TextRun {
    Inline(String),
    LineBreak,
    /// Start or end of a block element.
    Block,
    Heading(String),
    /// Explicit separator (`<hr>`).
    SectionPause,
    ListItem(String),
}

/// Converts one markup fragment into narrative text.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkupExtractor;

impl MarkupExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Flat run stream of the fragment body.
    pub fn runs(&self, html: &str) -> Vec<TextRun> {
        let doc = parse(html);
        self.runs_of(&doc)
    }

    pub fn runs_of(&self, doc: &Element) -> Vec<TextRun> {
        let body = doc.find_first("body").unwrap_or(doc);
        let mut out = Vec::new();
        for child in &body.children {
            self.walk(child, &mut out);
        }
        out
    }

    /// Narrative text of a fragment with block structure kept as newlines.
    pub fn extract(&self, html: &str) -> String {
        self.extract_parsed(html, &parse(html))
    }

    /// Same as [`extract`](Self::extract) for markup that is already parsed.
    pub fn extract_parsed(&self, html: &str, doc: &Element) -> String {
        let text = render(&self.runs_of(doc));

        if text.trim().is_empty() && !doc.has_element_children() && html.contains('<') {
            // Nothing recognisable as markup: let html2text make what it can of it.
            debug!(len = html.len(), "Markup unreadable, using html2text fallback");
            return html2text::from_read(html.as_bytes(), 10_000);
        }
        text
    }

    fn walk(&self, node: &Node, out: &mut Vec<TextRun>) {
        let el = match node {
            Node::Text(text) => {
                if text.trim().is_empty() {
                    if !text.is_empty() {
                        out.push(TextRun::Inline(" ".to_string()));
                    }
                } else {
                    let mut collapsed = String::new();
                    if text.starts_with(char::is_whitespace) {
                        collapsed.push(' ');
                    }
                    collapsed.push_str(&collapse_whitespace(text));
                    if text.ends_with(char::is_whitespace) {
                        collapsed.push(' ');
                    }
                    out.push(TextRun::Inline(collapsed));
                }
                return;
            }
            Node::Element(el) => el,
        };

        if is_noise_element(el) {
            return;
        }
        if el.name == "a" && is_note_link(el) {
            return;
        }

        if el.heading_level().is_some() {
            let title = self.element_text(el);
            if !title.is_empty() {
                out.push(TextRun::Heading(title));
            }
            return;
        }

        match el.name.as_str() {
            "br" => out.push(TextRun::LineBreak),
            "hr" => out.push(TextRun::SectionPause),
            "li" => {
                let text = self.element_text(el);
                if !text.is_empty() {
                    out.push(TextRun::ListItem(text));
                }
            }
            name => {
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push(TextRun::Block);
                }
                for child in &el.children {
                    self.walk(child, out);
                }
                if block {
                    out.push(TextRun::Block);
                }
            }
        }
    }

    /// Filtered text of an element on a single line.
    pub fn element_text(&self, el: &Element) -> String {
        let mut inner = Vec::new();
        for child in &el.children {
            self.walk(child, &mut inner);
        }
        collapse_whitespace(&render(&inner))
    }
}

/// Turn runs into text: blocks become newlines, headings stand alone.
pub fn render(runs: &[TextRun]) -> String {
    let mut text = String::new();
    for run in runs {
        match run {
            TextRun::Inline(s) => text.push_str(s),
            TextRun::LineBreak | TextRun::Block => text.push('\n'),
            TextRun::Heading(h) => {
                text.push_str("\n\n");
                text.push_str(h);
                text.push_str("\n\n");
            }
            TextRun::SectionPause => text.push_str("\n\n"),
            TextRun::ListItem(item) => {
                text.push('\n');
                text.push_str(item);
                if !item.ends_with(['.', '!', '?', ':', ';']) {
                    text.push('.');
                }
                text.push('\n');
            }
        }
    }
    text
}
