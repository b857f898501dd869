//! markdown to styled text runs.
//!
//! uses comrak for commonmark parsing. the view turns each run into a text
//! span, so only inline emphasis, code and headings are styled; block
//! structure is flattened to line breaks and bullet prefixes.

use comrak::nodes::{AstNode, NodeValue};
use comrak::{Arena, Options, parse_document};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStyle {
    pub strong: bool,
    pub emphasis: bool,
    pub code: bool,
    pub heading: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    pub style: RunStyle,
}

/// parse `source` and flatten it into runs. adjacent runs with the same style
/// are merged.
pub fn render_runs(source: &str) -> Vec<TextRun> {
    let arena = Arena::new();
    let root = parse_document(&arena, source, &Options::default());
    let mut out = RunBuilder::default();
    walk(root, RunStyle::default(), &mut out);
    out.finish()
}

#[derive(Default)]
struct RunBuilder {
    runs: Vec<TextRun>,
}

impl RunBuilder {
    fn push(&mut self, text: &str, style: RunStyle) {
        if text.is_empty() {
            return;
        }
        match self.runs.last_mut() {
            Some(last) if last.style == style => last.text.push_str(text),
            _ => self.runs.push(TextRun { text: text.to_string(), style }),
        }
    }

    fn block_break(&mut self) {
        if let Some(last) = self.runs.last_mut()
            && !last.text.ends_with("\n\n")
        {
            last.text.push_str(if last.text.ends_with('\n') { "\n" } else { "\n\n" });
        }
    }

    fn finish(mut self) -> Vec<TextRun> {
        if let Some(last) = self.runs.last_mut() {
            let kept = last.text.trim_end_matches('\n').len();
            last.text.truncate(kept);
        }
        self.runs.retain(|r| !r.text.is_empty());
        self.runs
    }
}

fn walk<'a>(node: &'a AstNode<'a>, style: RunStyle, out: &mut RunBuilder) {
    let value = node.data.borrow().value.clone();
    match value {
        NodeValue::Text(text) => out.push(&text, style),
        NodeValue::Code(code) => out.push(&code.literal, RunStyle { code: true, ..style }),
        NodeValue::SoftBreak => out.push(" ", style),
        NodeValue::LineBreak => out.push("\n", style),
        NodeValue::CodeBlock(block) => {
            out.push(block.literal.trim_end_matches('\n'), RunStyle { code: true, ..style });
            out.block_break();
        }
        NodeValue::Strong => children(node, RunStyle { strong: true, ..style }, out),
        NodeValue::Emph => children(node, RunStyle { emphasis: true, ..style }, out),
        NodeValue::Heading(_) => {
            children(node, RunStyle { heading: true, strong: true, ..style }, out);
            out.block_break();
        }
        NodeValue::Item(_) => {
            out.push("• ", style);
            children(node, style, out);
        }
        NodeValue::Paragraph => {
            children(node, style, out);
            // tight list items end with a single newline
            let in_item = node
                .parent()
                .is_some_and(|p| matches!(p.data.borrow().value, NodeValue::Item(_)));
            if in_item {
                out.push("\n", style);
            } else {
                out.block_break();
            }
        }
        NodeValue::List(_) | NodeValue::BlockQuote => {
            children(node, style, out);
            out.block_break();
        }
        NodeValue::ThematicBreak => {
            out.push("---", style);
            out.block_break();
        }
        NodeValue::HtmlInline(raw) => out.push(&raw, style),
        _ => children(node, style, out),
    }
}

fn children<'a>(node: &'a AstNode<'a>, style: RunStyle, out: &mut RunBuilder) {
    for child in node.children() {
        walk(child, style, out);
    }
}
