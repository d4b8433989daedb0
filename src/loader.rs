use std::path::Path;

use anyhow::Result;

/// Turns an attachment file into plain text. Polymorphic over file type;
/// how raw bytes become text is a pluggable concern, not the engine's.
pub trait ContentLoader {
    fn load_text(&self, path: &Path) -> Result<String>;
}

/// Default loader: dispatches on file extension.
///
/// `pdf` goes through pdf-extract, `docx`/`doc` through docx-rs, and
/// plain-text formats (including markdown and subtitle/transcript files)
/// are read as UTF-8. Unknown extensions fall back to a plain UTF-8 read,
/// so only unreadable or binary content surfaces an error naming the path.
#[derive(Debug, Default, Clone)]
pub struct ExtensionLoader;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text", "vtt", "srt"];

impl ContentLoader for ExtensionLoader {
    fn load_text(&self, path: &Path) -> Result<String> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if extension == "pdf" {
            tracing::debug!(path = %path.display(), "loading pdf");
            return pdf_extract::extract_text(path)
                .map_err(|e| anyhow::anyhow!("pdf extraction failed: {e}"));
        }
        if extension == "docx" || extension == "doc" {
            tracing::debug!(path = %path.display(), "loading docx");
            return docx_text(path);
        }
        if TEXT_EXTENSIONS.contains(&extension.as_str()) {
            tracing::debug!(path = %path.display(), "loading text");
            return Ok(std::fs::read_to_string(path)?);
        }
        // Generic fallback for unlisted formats: attempt a UTF-8 read.
        tracing::debug!(path = %path.display(), "loading as generic text");
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Extracts the run text of every paragraph in a docx body, one line per
/// paragraph. Tables and drawings are skipped.
fn docx_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let docx =
        docx_rs::read_docx(&bytes).map_err(|e| anyhow::anyhow!("docx parsing failed: {e}"))?;

    let mut out = String::new();
    for child in &docx.document.children {
        let docx_rs::DocumentChild::Paragraph(paragraph) = child else {
            continue;
        };
        let mut line = String::new();
        for content in &paragraph.children {
            let docx_rs::ParagraphChild::Run(run) = content else {
                continue;
            };
            for piece in &run.children {
                if let docx_rs::RunChild::Text(text) = piece {
                    line.push_str(&text.text);
                }
            }
        }
        if !line.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&line);
        }
    }
    Ok(out)
}
