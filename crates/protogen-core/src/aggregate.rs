//! Merging stage outputs into one document.
//!
//! [`aggregate`] builds a structured [`AggregatedDocument`] from the
//! succeeded stages of a run. A [`DocumentRenderer`] turns it into text;
//! [`MarkdownRenderer`] is the only format shipped.

use std::fmt::Write as _;

use serde::Serialize;

use protogen_pm::DeliverableKind;

use crate::result::StageResult;

/// Which optional parts to include in the merged document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    pub include_toc: bool,
    pub include_metadata: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            include_toc: true,
            include_metadata: true,
        }
    }
}

/// One succeeded stage inside the merged document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub kind: DeliverableKind,
    pub title: String,
    pub anchor: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TocEntry {
    /// 1-based position.
    pub number: usize,
    pub title: String,
    pub anchor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentMetadata {
    pub model: Option<String>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Succeeded stages in run order, with optional TOC and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedDocument {
    pub sections: Vec<Section>,
    pub toc: Option<Vec<TocEntry>>,
    pub metadata: Option<DocumentMetadata>,
}

impl AggregatedDocument {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

/// Build the merged document from a run's stage results.
///
/// Failed and skipped stages are left out; they only show up in the
/// metadata counts.
pub fn aggregate(
    results: &[StageResult],
    model: Option<&str>,
    options: AggregateOptions,
) -> AggregatedDocument {
    let sections: Vec<Section> = results
        .iter()
        .filter(|r| r.success())
        .map(|r| {
            let title = r.kind().title().to_owned();
            Section {
                kind: r.kind(),
                anchor: anchor(&title),
                title,
                text: r.text().to_owned(),
            }
        })
        .collect();

    let toc = options.include_toc.then(|| {
        sections
            .iter()
            .enumerate()
            .map(|(i, s)| TocEntry {
                number: i + 1,
                title: s.title.clone(),
                anchor: s.anchor.clone(),
            })
            .collect()
    });

    let metadata = options.include_metadata.then(|| DocumentMetadata {
        model: model.map(str::to_owned),
        succeeded: sections.len(),
        failed: results.len() - sections.len(),
    });

    AggregatedDocument {
        sections,
        toc,
        metadata,
    }
}

fn anchor(title: &str) -> String {
    title.to_lowercase().replace(' ', "-")
}

/// Turns an [`AggregatedDocument`] into its final text form.
pub trait DocumentRenderer: Send + Sync {
    fn render(&self, document: &AggregatedDocument) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl DocumentRenderer for MarkdownRenderer {
    fn render(&self, document: &AggregatedDocument) -> String {
        if document.is_empty() {
            return "# Document Generation Failed\n\nNo deliverables were successfully generated.\n"
                .to_owned();
        }

        let mut out = String::from("# Generated Documentation\n\n");

        if let Some(toc) = &document.toc {
            out.push_str("## Table of Contents\n\n");
            for entry in toc {
                let _ = writeln!(out, "{}. [{}](#{})", entry.number, entry.title, entry.anchor);
            }
            out.push('\n');
        }

        for section in &document.sections {
            let _ = write!(out, "## {}\n\n{}\n\n---\n\n", section.title, section.text.trim());
        }

        if let Some(meta) = &document.metadata {
            out.push_str("## Generation Metadata\n\n");
            let _ = writeln!(out, "- **Successful deliverables**: {}", meta.succeeded);
            let _ = writeln!(out, "- **Failed deliverables**: {}", meta.failed);
            let _ = writeln!(
                out,
                "- **Model used**: {}",
                meta.model.as_deref().unwrap_or("unresolved")
            );
        }

        out
    }
}

/// Render with [`MarkdownRenderer`].
pub fn render_markdown(document: &AggregatedDocument) -> String {
    MarkdownRenderer.render(document)
}
