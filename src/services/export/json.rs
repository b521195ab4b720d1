use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{BookExport, ExportFormat, Exporter};
use crate::error::Result;
use crate::models::{Audience, Genre, Tone, WritingStyle};

#[derive(Serialize)]
struct BookDocument<'a> {
    titulo: &'a str,
    sinopsis: &'a str,
    capitulos: Vec<ChapterEntry<'a>>,
    metadata: Metadata,
}

#[derive(Serialize)]
struct ChapterEntry<'a> {
    numero: u32,
    titulo: &'a str,
    contenido: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    genero: Genre,
    estilo: WritingStyle,
    tono: Tone,
    audiencia: Audience,
    palabras_totales: usize,
    fecha_generacion: DateTime<Utc>,
}

pub struct JsonExporter;

impl Exporter for JsonExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn render(&self, book: &BookExport) -> Result<Vec<u8>> {
        let config = &book.configuration;
        let document = BookDocument {
            titulo: &book.title,
            sinopsis: &book.synopsis,
            capitulos: book
                .chapters
                .iter()
                .map(|chapter| ChapterEntry {
                    numero: chapter.number,
                    titulo: &chapter.title,
                    contenido: &chapter.content,
                })
                .collect(),
            metadata: Metadata {
                genero: config.genre,
                estilo: config.style,
                tono: config.tone,
                audiencia: config.audience,
                palabras_totales: book.total_words(),
                fecha_generacion: Utc::now(),
            },
        };
        Ok(serde_json::to_vec_pretty(&document)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::export::tests::book;

    #[test]
    fn test_document_shape() {
        let book = book();
        let value: serde_json::Value =
            serde_json::from_slice(&JsonExporter.render(&book).unwrap()).unwrap();
        assert_eq!(value["titulo"], "Niebla sobre el Sena");
        assert_eq!(value["capitulos"].as_array().unwrap().len(), 3);
        assert_eq!(value["capitulos"][0]["numero"], 1);
        assert!(value["capitulos"][0].get("palabras").is_none());
        assert_eq!(value["metadata"]["audiencia"], "Adultos");
        assert_eq!(value["metadata"]["palabrasTotales"], book.total_words());
        assert!(value["metadata"]["fechaGeneracion"].is_string());
    }
}
