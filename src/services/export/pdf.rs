//! PDF rendering through an in-memory Typst world.

use std::fmt::Write;

use chrono::{Datelike, Utc};
use typst::foundations::{Bytes, Datetime};
use typst::syntax::{FileId, Source, VirtualPath};
use typst::text::{Font, FontBook};
use typst::utils::LazyHash;
use typst::{Library, LibraryExt, World};

use super::{BookExport, ExportFormat, Exporter};
use crate::error::{AppError, Result};

pub struct PdfExporter {
    font_book: LazyHash<FontBook>,
    fonts: Vec<Font>,
}

impl PdfExporter {
    pub fn new() -> Result<Self> {
        let fonts: Vec<Font> = typst_assets::fonts()
            .filter_map(|data| Font::new(Bytes::new(data), 0))
            .collect();
        if fonts.is_empty() {
            return Err(AppError::Export("no fonts available for PDF".to_string()));
        }

        let mut font_book = FontBook::new();
        for font in &fonts {
            font_book.push(font.info().clone());
        }

        Ok(Self {
            font_book: LazyHash::new(font_book),
            fonts,
        })
    }
}

impl Exporter for PdfExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Pdf
    }

    fn render(&self, book: &BookExport) -> Result<Vec<u8>> {
        let world = BookWorld::new(markup(book), self.font_book.clone(), self.fonts.clone());

        let compiled = typst::compile(&world);
        for warning in &compiled.warnings {
            tracing::warn!(message = %warning.message, "typst warning");
        }
        let document = compiled.output.map_err(|errors| {
            AppError::Export(format!("typst compilation failed: {}", join_messages(&errors)))
        })?;

        typst_pdf::pdf(&document, &typst_pdf::PdfOptions::default())
            .map_err(|errors| AppError::Export(format!("PDF generation failed: {}", join_messages(&errors))))
    }
}

fn join_messages(errors: &[typst::diag::SourceDiagnostic]) -> String {
    errors
        .iter()
        .map(|error| error.message.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Escapes characters with markup meaning in Typst.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '#' | '@' | '<' | '>' | '[' | ']' | '{' | '}' | '$' | '_' | '*' | '`' | '=' | '-' | '+' | '/' | '~'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escapes a value for a Typst string literal.
fn string_literal(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn markup(book: &BookExport) -> String {
    let config = &book.configuration;
    let mut doc = String::new();
    let _ = write!(
        doc,
        "#set document(title: \"{}\")\n\
         #set page(paper: \"a4\", margin: (x: 2cm, y: 2.5cm), numbering: \"1\")\n\
         #set text(size: 12pt, lang: \"es\")\n\
         #set par(justify: true)\n\n",
        string_literal(&book.title)
    );

    let _ = write!(
        doc,
        "#align(center)[#text(size: 24pt, weight: \"bold\")[{}]]\n\n\
         #align(center)[_{} · {} · {}_]\n\n",
        escape(&book.title),
        escape(config.genre.as_str()),
        escape(config.style.as_str()),
        escape(config.tone.as_str()),
    );
    for paragraph in paragraphs(&book.synopsis) {
        let _ = write!(doc, "{}\n\n", escape(paragraph));
    }
    doc.push_str("#pagebreak()\n\n");

    if book.chapters.len() > 1 {
        doc.push_str("#outline(title: \"Índice\")\n\n#pagebreak()\n\n");
    }

    for (index, chapter) in book.chapters.iter().enumerate() {
        if index > 0 {
            doc.push_str("#pagebreak()\n\n");
        }
        let _ = write!(
            doc,
            "= Capítulo {}: {}\n\n",
            chapter.number,
            escape(&chapter.title)
        );
        for paragraph in paragraphs(&chapter.content) {
            let _ = write!(doc, "{}\n\n", escape(paragraph));
        }
    }

    doc
}

fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty())
}

struct BookWorld {
    main: Source,
    library: LazyHash<Library>,
    font_book: LazyHash<FontBook>,
    fonts: Vec<Font>,
}

impl BookWorld {
    fn new(content: String, font_book: LazyHash<FontBook>, fonts: Vec<Font>) -> Self {
        let id = FileId::new(None, VirtualPath::new("libro.typ"));
        Self {
            main: Source::new(id, content),
            library: LazyHash::new(Library::builder().build()),
            font_book,
            fonts,
        }
    }
}

impl World for BookWorld {
    fn library(&self) -> &LazyHash<Library> {
        &self.library
    }

    fn book(&self) -> &LazyHash<FontBook> {
        &self.font_book
    }

    fn main(&self) -> FileId {
        self.main.id()
    }

    fn source(&self, id: FileId) -> typst::diag::FileResult<Source> {
        if id == self.main.id() {
            Ok(self.main.clone())
        } else {
            Err(typst::diag::FileError::NotFound(
                id.vpath().as_rootless_path().into(),
            ))
        }
    }

    fn file(&self, id: FileId) -> typst::diag::FileResult<Bytes> {
        Err(typst::diag::FileError::NotFound(
            id.vpath().as_rootless_path().into(),
        ))
    }

    fn font(&self, index: usize) -> Option<Font> {
        self.fonts.get(index).cloned()
    }

    fn today(&self, _offset: Option<i64>) -> Option<Datetime> {
        let now = Utc::now();
        Datetime::from_ymd(now.year(), now.month() as u8, now.day() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::export::tests::book;

    #[test]
    fn test_escape() {
        assert_eq!(escape("Hola #mundo"), "Hola \\#mundo");
        assert_eq!(escape("[x] $1"), "\\[x\\] \\$1");
        assert_eq!(escape("a_b*c"), "a\\_b\\*c");
    }

    #[test]
    fn test_markup_lists_chapters_in_order() {
        let doc = markup(&book());
        assert!(doc.starts_with("#set document(title: \"Niebla sobre el Sena\")"));
        let first = doc.find("= Capítulo 1:").unwrap();
        let second = doc.find("= Capítulo 2:").unwrap();
        assert!(first < second);
        assert!(doc.contains("\\<con\\> & símbolos."));
        assert_eq!(doc.matches("#pagebreak()").count(), 4);
    }

    #[test]
    fn test_renders_pdf() {
        let bytes = PdfExporter::new().unwrap().render(&book()).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }
}
