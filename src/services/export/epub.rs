use std::fmt::Display;

use epub_builder::{EpubBuilder, EpubContent, ReferenceType, ZipLibrary};
use html_escape::encode_text;

use super::{BookExport, ExportFormat, Exporter};
use crate::error::{AppError, Result};

const STYLESHEET: &str = "
body { font-family: Georgia, serif; line-height: 1.6; margin: 1em; }
h1 { color: #2c3e50; border-bottom: 2px solid #3498db; padding-bottom: 0.5em; margin-top: 1.5em; }
h2 { color: #34495e; margin-top: 1.2em; }
p { text-align: justify; margin-bottom: 1em; }
.metadata { font-style: italic; color: #7f8c8d; border-left: 3px solid #3498db; padding-left: 1em; margin: 1.5em 0; }
";

pub struct EpubExporter;

fn epub_error(error: impl Display) -> AppError {
    AppError::Export(format!("EPUB: {error}"))
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" lang="es">
<head>
  <meta charset="UTF-8"/>
  <title>{}</title>
  <link rel="stylesheet" type="text/css" href="stylesheet.css"/>
</head>
<body>
{body}
</body>
</html>"#,
        encode_text(title)
    )
}

/// Blank-line separated paragraphs; single newlines become line breaks.
fn paragraphs(content: &str) -> String {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| {
            let lines: Vec<_> = paragraph.lines().map(encode_text).collect();
            format!("  <p>{}</p>", lines.join("<br/>"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn title_page(book: &BookExport) -> String {
    let config = &book.configuration;
    let body = format!(
        r#"  <h1>{title}</h1>
  <div class="metadata">
    <p><strong>Género:</strong> {genre}</p>
    <p><strong>Estilo:</strong> {style}</p>
    <p><strong>Tono:</strong> {tone}</p>
    <p><strong>Audiencia:</strong> {audience}</p>
    <p><strong>Palabras:</strong> {words}</p>
    <p><strong>Capítulos:</strong> {chapters}</p>
  </div>
  <h2>Sinopsis</h2>
{synopsis}"#,
        title = encode_text(&book.title),
        genre = config.genre,
        style = config.style,
        tone = config.tone,
        audience = config.audience,
        words = book.total_words(),
        chapters = book.chapters.len(),
        synopsis = paragraphs(&book.synopsis),
    );
    page(&book.title, &body)
}

impl Exporter for EpubExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Epub
    }

    fn render(&self, book: &BookExport) -> Result<Vec<u8>> {
        let mut builder = EpubBuilder::new(ZipLibrary::new().map_err(epub_error)?).map_err(epub_error)?;
        builder
            .metadata("title", &book.title)
            .map_err(epub_error)?
            .metadata("author", "Generado con IA")
            .map_err(epub_error)?
            .metadata("lang", "es")
            .map_err(epub_error)?
            .metadata("generator", env!("CARGO_PKG_NAME"))
            .map_err(epub_error)?;
        if !book.synopsis.trim().is_empty() {
            builder
                .metadata("description", &book.synopsis)
                .map_err(epub_error)?;
        }
        builder
            .stylesheet(STYLESHEET.as_bytes())
            .map_err(epub_error)?;

        builder
            .add_content(
                EpubContent::new("title.xhtml", title_page(book).as_bytes())
                    .title("Portada")
                    .reftype(ReferenceType::TitlePage),
            )
            .map_err(epub_error)?;

        for chapter in &book.chapters {
            let heading = format!("Capítulo {}: {}", chapter.number, chapter.title);
            let body = format!(
                "  <h1>Capítulo {}</h1>\n  <h2>{}</h2>\n{}",
                chapter.number,
                encode_text(&chapter.title),
                paragraphs(&chapter.content)
            );
            builder
                .add_content(
                    EpubContent::new(
                        format!("chapter_{}.xhtml", chapter.number),
                        page(&heading, &body).as_bytes(),
                    )
                    .title(heading)
                    .reftype(ReferenceType::Text),
                )
                .map_err(epub_error)?;
        }

        let mut bytes = Vec::new();
        builder.generate(&mut bytes).map_err(epub_error)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::export::tests::book;
    use std::io::{Cursor, Read};

    fn entries(bytes: Vec<u8>) -> Vec<(String, String)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|index| {
                let mut file = archive.by_index(index).unwrap();
                let mut text = String::new();
                let _ = file.read_to_string(&mut text);
                (file.name().to_string(), text)
            })
            .collect()
    }

    #[test]
    fn test_archive_contains_every_chapter() {
        let files = entries(EpubExporter.render(&book()).unwrap());

        let (name, mimetype) = &files[0];
        assert_eq!(name, "mimetype");
        assert_eq!(mimetype.trim(), "application/epub+zip");

        for number in 1..=3 {
            let (_, chapter) = files
                .iter()
                .find(|(name, _)| name.ends_with(&format!("chapter_{number}.xhtml")))
                .unwrap();
            assert!(chapter.contains(&format!("Primer párrafo del capítulo {number}.")));
            assert!(chapter.contains("&lt;con&gt; &amp; símbolos"));
        }
        assert!(files.iter().any(|(_, text)| text.contains("Niebla sobre el Sena")));
    }

    #[test]
    fn test_paragraphs() {
        assert_eq!(
            paragraphs("uno\ndos\n\n\n\ntres"),
            "  <p>uno<br/>dos</p>\n  <p>tres</p>"
        );
    }
}
