//! Minimal scoped XML document builder.
//!
//! Namespace-ignorant by design: callers supply `xmlns` attributes where
//! they need them. Nesting is expressed with closures, so a closing tag is
//! emitted on every exit path of the scope that opened it, including a
//! scope whose body returns an error:
//!
//! ```
//! use epprelay::xml::XmlBuilder;
//!
//! let mut xml = XmlBuilder::new();
//! xml.element("root", &[("xmlns", "urn:example")], |xml| {
//!     xml.leaf("leaf", "value");
//! });
//! assert!(xml.into_string().ends_with("</root>"));
//! ```

/// UTF-8 XML document builder.
pub struct XmlBuilder {
    buf: String,
}

impl XmlBuilder {
    /// Start a new document with the XML declaration.
    pub fn new() -> Self {
        Self {
            buf: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"),
        }
    }

    /// Open an element, run `body` to fill it, then close it. The closing
    /// tag is written whatever `body` returns; its value is passed through.
    pub fn element<R>(
        &mut self,
        name: &str,
        attrs: &[(&str, &str)],
        body: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.open_tag(name, attrs);
        let out = body(self);
        self.buf.push_str("</");
        self.buf.push_str(name);
        self.buf.push('>');
        out
    }

    /// An element holding only character data: `<name>text</name>`.
    pub fn leaf(&mut self, name: &str, text: &str) {
        self.element(name, &[], |xml| xml.text(text));
    }

    /// A self-closing element: `<name/>`.
    pub fn empty(&mut self, name: &str) {
        self.buf.push('<');
        self.buf.push_str(name);
        self.buf.push_str("/>");
    }

    /// Append escaped character data to the current element.
    pub fn text(&mut self, text: &str) {
        escape_into(text, false, &mut self.buf);
    }

    /// Finish the document.
    pub fn into_string(self) -> String {
        self.buf
    }

    fn open_tag(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.buf.push('<');
        self.buf.push_str(name);
        for (key, value) in attrs {
            self.buf.push(' ');
            self.buf.push_str(key);
            self.buf.push_str("=\"");
            escape_into(value, true, &mut self.buf);
            self.buf.push('"');
        }
        self.buf.push('>');
    }
}

impl Default for XmlBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_into(raw: &str, in_attribute: bool, out: &mut String) {
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if in_attribute => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}
