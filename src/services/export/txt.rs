use std::fmt::Write;

use super::{BookExport, ExportFormat, Exporter};
use crate::error::Result;

const RULE_WIDTH: usize = 60;

pub struct TxtExporter;

impl Exporter for TxtExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Txt
    }

    fn render(&self, book: &BookExport) -> Result<Vec<u8>> {
        let heavy = "=".repeat(RULE_WIDTH);
        let light = "-".repeat(RULE_WIDTH);

        let mut text = String::new();
        let _ = write!(
            text,
            "{heavy}\n{}\n{heavy}\n\n{}\n\n{heavy}\n\n\n",
            book.title.to_uppercase(),
            book.synopsis
        );
        for chapter in &book.chapters {
            let _ = write!(
                text,
                "{light}\nCAPÍTULO {}: {}\n{light}\n\n{}\n\n\n",
                chapter.number,
                chapter.title.to_uppercase(),
                chapter.content
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
    fn test_layout() {
        let text = String::from_utf8(TxtExporter.render(&book()).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "=".repeat(60));
        assert_eq!(lines[1], "NIEBLA SOBRE EL SENA");
        assert!(text.contains("CAPÍTULO 1: CAPÍTULO DE PRUEBA 1\n"));
        let first = text.find("CAPÍTULO 1:").unwrap();
        let third = text.find("CAPÍTULO 3:").unwrap();
        assert!(first < third);
        assert!(text.contains("Segundo párrafo <con> & símbolos."));
    }
}
