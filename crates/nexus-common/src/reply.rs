//! Dual text/html rendering for control-plane replies.
//!
//! Hook handlers write structure (sections, tables, lists) into a
//! `ReplyStream`; the requested `format` option decides whether that comes
//! out as plain text or html. Text mode is deliberately bare so scripted
//! clients can parse it.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    Text,
    Html,
}

pub struct ReplyStream {
    format: ReplyFormat,
    title: String,
    body: String,
    finished: bool,
}

impl ReplyStream {
    /// Format comes from the request's `format` option (`text` or `html`,
    /// default html).
    pub fn new(args: &BTreeMap<String, String>, title: &str) -> Self {
        let format = match args.get("format").map(|s| s.as_str()) {
            Some("text") => ReplyFormat::Text,
            _ => ReplyFormat::Html,
        };
        ReplyStream::with_format(format, title)
    }

    pub fn with_format(format: ReplyFormat, title: &str) -> Self {
        let mut rs = ReplyStream {
            format,
            title: title.to_string(),
            body: String::new(),
            finished: false,
        };
        if format == ReplyFormat::Html {
            rs.body.push_str("<html>\n<head><title>");
            rs.body.push_str(&html_escape(title));
            rs.body.push_str("</title></head>\n<body>\n");
            rs.body.push_str(&format!("<h1>{}</h1>\n", html_escape(title)));
        }
        rs
    }

    pub fn format(&self) -> ReplyFormat {
        self.format
    }

    pub fn content_type(&self) -> &'static str {
        match self.format {
            ReplyFormat::Text => "text/plain",
            ReplyFormat::Html => "text/html",
        }
    }

    /// Append a line verbatim (plus newline) in either format.
    pub fn raw(&mut self, line: &str) {
        self.body.push_str(line);
        self.body.push('\n');
    }

    pub fn mk_section(&mut self, heading: &str) {
        match self.format {
            ReplyFormat::Text => {
                self.body.push_str(heading);
                self.body.push('\n');
            }
            ReplyFormat::Html => {
                self.body.push_str(&format!("<h2>{}</h2>\n", html_escape(heading)));
            }
        }
    }

    pub fn mk_text(&mut self, text: &str) {
        match self.format {
            ReplyFormat::Text => {
                self.body.push_str(text);
                self.body.push('\n');
            }
            ReplyFormat::Html => {
                self.body.push_str(&format!("<p>{}</p>\n", text));
            }
        }
    }

    pub fn mk_list(&mut self, items: &[String], heading: &str) {
        match self.format {
            ReplyFormat::Text => {
                if !heading.is_empty() {
                    self.body.push_str(heading);
                    self.body.push('\n');
                }
                for i in items {
                    self.body.push_str(i);
                    self.body.push('\n');
                }
            }
            ReplyFormat::Html => {
                if !heading.is_empty() {
                    self.body.push_str(&format!("<h3>{}</h3>\n", html_escape(heading)));
                }
                self.body.push_str("<ul>\n");
                for i in items {
                    self.body.push_str(&format!("<li>{}</li>\n", i));
                }
                self.body.push_str("</ul>\n");
            }
        }
    }

    pub fn table_begin(&mut self, heading: &str) {
        match self.format {
            ReplyFormat::Text => {
                if !heading.is_empty() {
                    self.body.push_str(heading);
                    self.body.push('\n');
                }
            }
            ReplyFormat::Html => {
                if !heading.is_empty() {
                    self.body.push_str(&format!("<h3>{}</h3>\n", html_escape(heading)));
                }
                self.body.push_str("<table border=1>\n");
            }
        }
    }

    pub fn table_top(&mut self, cols: &[&str]) {
        match self.format {
            ReplyFormat::Text => {
                self.body.push_str(&cols.join("\t"));
                self.body.push('\n');
            }
            ReplyFormat::Html => {
                self.body.push_str("<tr>");
                for c in cols {
                    self.body.push_str(&format!("<th>{}</th>", html_escape(c)));
                }
                self.body.push_str("</tr>\n");
            }
        }
    }

    pub fn table_row(&mut self, cells: &[String]) {
        match self.format {
            ReplyFormat::Text => {
                self.body.push_str(&cells.join("\t"));
                self.body.push('\n');
            }
            ReplyFormat::Html => {
                self.body.push_str("<tr>");
                for c in cells {
                    self.body.push_str(&format!("<td>{}</td>", c));
                }
                self.body.push_str("</tr>\n");
            }
        }
    }

    pub fn table_end(&mut self) {
        if self.format == ReplyFormat::Html {
            self.body.push_str("</table>\n");
        }
    }

    pub fn create_link(&self, text: &str, url: &str) -> String {
        match self.format {
            ReplyFormat::Text => format!("{} ({})", text, url),
            ReplyFormat::Html => format!("<a href=\"{}\">{}</a>", url, html_escape(text)),
        }
    }

    pub fn create_bold(&self, text: &str) -> String {
        match self.format {
            ReplyFormat::Text => text.to_string(),
            ReplyFormat::Html => format!("<b>{}</b>", html_escape(text)),
        }
    }

    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.format == ReplyFormat::Html {
            self.body.push_str("</body>\n</html>\n");
        }
    }

    /// Final body; closes the document if the handler forgot to.
    pub fn into_body(mut self) -> String {
        self.finish();
        self.body
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
