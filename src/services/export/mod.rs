//! Book exporters.
//!
//! Every format takes the same input, a title, a synopsis, the completed
//! chapters and the configuration, and returns bytes plus a file name.

mod epub;
mod json;
mod markdown;
#[cfg(feature = "pdf")]
mod pdf;
mod txt;

use std::str::FromStr;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::error::{AppError, Result};
use crate::models::{BookConfiguration, Chapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Txt,
    Markdown,
    Json,
    Epub,
    Pdf,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Markdown => "md",
            ExportFormat::Json => "json",
            ExportFormat::Epub => "epub",
            ExportFormat::Pdf => "pdf",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "text/plain; charset=utf-8",
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
            ExportFormat::Json => "application/json",
            ExportFormat::Epub => "application/epub+zip",
            ExportFormat::Pdf => "application/pdf",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "txt" => Ok(ExportFormat::Txt),
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            "epub" => Ok(ExportFormat::Epub),
            "pdf" => Ok(ExportFormat::Pdf),
            other => Err(AppError::Configuration(format!(
                "Formato de exportación no soportado: {other}"
            ))),
        }
    }
}

/// Export request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportRequest {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "sinopsis", default)]
    pub synopsis: String,
    #[serde(rename = "capitulos", default)]
    pub chapters: Vec<Chapter>,
    #[serde(rename = "configuracion")]
    pub configuration: BookConfiguration,
}

/// A validated book ready to render: completed chapters only, in order.
#[derive(Debug, Clone)]
pub struct BookExport {
    pub title: String,
    pub synopsis: String,
    pub chapters: Vec<Chapter>,
    pub configuration: BookConfiguration,
}

impl BookExport {
    pub fn total_words(&self) -> usize {
        self.chapters.iter().map(|chapter| chapter.word_count).sum()
    }
}

impl TryFrom<ExportRequest> for BookExport {
    type Error = AppError;

    fn try_from(request: ExportRequest) -> Result<Self> {
        if request.title.trim().is_empty() {
            return Err(AppError::Configuration(
                "Parámetros requeridos faltantes".to_string(),
            ));
        }
        let mut chapters: Vec<Chapter> = request
            .chapters
            .into_iter()
            .filter(Chapter::is_completed)
            .collect();
        if chapters.is_empty() {
            return Err(AppError::Configuration(
                "No hay capítulos completados para exportar".to_string(),
            ));
        }
        chapters.sort_by_key(|chapter| chapter.number);

        Ok(BookExport {
            title: request.title,
            synopsis: request.synopsis,
            chapters,
            configuration: request.configuration,
        })
    }
}

pub struct ExportedFile {
    pub filename: String,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
}

pub trait Exporter {
    fn format(&self) -> ExportFormat;

    fn render(&self, book: &BookExport) -> Result<Vec<u8>>;
}

fn exporter_for(format: ExportFormat) -> Result<Box<dyn Exporter>> {
    match format {
        ExportFormat::Txt => Ok(Box::new(txt::TxtExporter)),
        ExportFormat::Markdown => Ok(Box::new(markdown::MarkdownExporter)),
        ExportFormat::Json => Ok(Box::new(json::JsonExporter)),
        ExportFormat::Epub => Ok(Box::new(epub::EpubExporter)),
        #[cfg(feature = "pdf")]
        ExportFormat::Pdf => Ok(Box::new(pdf::PdfExporter::new()?)),
        #[cfg(not(feature = "pdf"))]
        ExportFormat::Pdf => Err(AppError::Export(
            "this build does not include PDF support".to_string(),
        )),
    }
}

/// Renders `request` in `format`. CPU-bound for EPUB and PDF.
#[instrument(skip(request), fields(title = %request.title))]
pub fn export(format: ExportFormat, request: ExportRequest) -> Result<ExportedFile> {
    let book = BookExport::try_from(request)?;
    let exporter = exporter_for(format)?;
    let bytes = exporter.render(&book)?;
    info!(
        format = exporter.format().extension(),
        chapters = book.chapters.len(),
        bytes = bytes.len(),
        "book exported"
    );

    Ok(ExportedFile {
        filename: filename(&book.title, format),
        mime_type: format.mime_type(),
        bytes,
    })
}

/// Lowercased title with every non-alphanumeric ASCII character replaced by `_`.
pub fn filename(title: &str, format: ExportFormat) -> String {
    let stem: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.{}", format.extension())
}
