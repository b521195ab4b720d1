use std::fmt::Write;

use super::{BookExport, ExportFormat, Exporter};
use crate::error::Result;

pub struct MarkdownExporter;

impl Exporter for MarkdownExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Markdown
    }

    fn render(&self, book: &BookExport) -> Result<Vec<u8>> {
        let config = &book.configuration;
        let mut text = String::new();
        let _ = write!(
            text,
            "# {}\n\n**Género:** {} | **Estilo:** {} | **Tono:** {}\n\n## Sinopsis\n\n{}\n\n---\n\n",
            book.title, config.genre, config.style, config.tone, book.synopsis
        );
        for chapter in &book.chapters {
            let _ = write!(
                text,
                "## Capítulo {}: {}\n\n{}\n\n---\n\n",
                chapter.number, chapter.title, chapter.content
            );
        }
        Ok(text.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::export::tests::book;

    #[test]
    fn test_headings_and_metadata() {
        let text = String::from_utf8(MarkdownExporter.render(&book()).unwrap()).unwrap();
        assert!(text.starts_with("# Niebla sobre el Sena\n\n"));
        assert!(text.contains("**Género:** Misterio | **Estilo:** Descriptivo | **Tono:** Serio"));
        assert!(text.contains("## Capítulo 2: Capítulo de prueba 2\n\n"));
        assert_eq!(text.matches("---").count(), 4);
    }
}
