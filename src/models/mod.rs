pub mod state;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use state::{Action, GenerationState, Stage};

pub const MIN_CHAPTERS: u32 = 1;
pub const MAX_CHAPTERS: u32 = 50;
/// Characters kept from the end of a chapter as continuity context.
pub const SUMMARY_LIMIT: usize = 500;

macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labelled_enum!(Genre {
    Fiction => "Ficción",
    NonFiction => "No Ficción",
    Fantasy => "Fantasía",
    ScienceFiction => "Ciencia Ficción",
    Mystery => "Misterio",
    Romance => "Romance",
    SelfHelp => "Autoayuda",
    Biography => "Biografía",
});

labelled_enum!(WritingStyle {
    Descriptive => "Descriptivo",
    Concise => "Conciso",
    Poetic => "Poético",
    Journalistic => "Periodístico",
    Academic => "Académico",
    Conversational => "Conversacional",
});

labelled_enum!(Tone {
    Formal => "Formal",
    Casual => "Casual",
    Humorous => "Humorístico",
    Serious => "Serio",
    Inspirational => "Inspiracional",
    Dark => "Oscuro",
});

labelled_enum!(Audience {
    Children => "Niños",
    YoungAdults => "Jóvenes Adultos",
    Adults => "Adultos",
    Academic => "Académico",
});

/// What the user asked for. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookConfiguration {
    #[serde(rename = "tema")]
    pub topic: String,
    #[serde(rename = "genero")]
    pub genre: Genre,
    #[serde(rename = "numeroCapitulos")]
    pub chapter_count: u32,
    #[serde(rename = "estiloEscritura")]
    pub style: WritingStyle,
    #[serde(rename = "tono")]
    pub tone: Tone,
    #[serde(rename = "audienciaObjetivo")]
    pub audience: Audience,
    #[serde(rename = "modelo", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BookConfiguration {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.topic.trim().is_empty() {
            return Err(crate::error::AppError::Configuration(
                "El tema es requerido".to_string(),
            ));
        }
        if !(MIN_CHAPTERS..=MAX_CHAPTERS).contains(&self.chapter_count) {
            return Err(crate::error::AppError::Configuration(format!(
                "El número de capítulos debe estar entre {MIN_CHAPTERS} y {MAX_CHAPTERS}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterStub {
    #[serde(rename = "numero")]
    pub number: u32,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "descripcion")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "descripcion")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "sinopsis")]
    pub synopsis: String,
    #[serde(rename = "capitulos")]
    pub chapters: Vec<ChapterStub>,
    #[serde(rename = "personajes", default)]
    pub characters: Vec<Character>,
    #[serde(rename = "arcoNarrativo", default)]
    pub narrative_arc: String,
}

impl Outline {
    pub fn stub(&self, number: u32) -> Option<&ChapterStub> {
        self.chapters.iter().find(|stub| stub.number == number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChapterStatus {
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "generando")]
    Generating,
    #[serde(rename = "completado")]
    Completed,
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(rename = "numero")]
    pub number: u32,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "contenido")]
    pub content: String,
    #[serde(rename = "palabras")]
    pub word_count: usize,
    #[serde(rename = "resumen", default)]
    pub summary: String,
    #[serde(rename = "estado")]
    pub status: ChapterStatus,
}

impl Chapter {
    pub fn pending(stub: &ChapterStub) -> Self {
        Chapter {
            number: stub.number,
            title: stub.title.clone(),
            content: String::new(),
            word_count: 0,
            summary: String::new(),
            status: ChapterStatus::Pending,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChapterStatus::Completed
    }

    /// Replaces the content and refreshes every value derived from it.
    pub fn set_content(&mut self, content: String) {
        self.word_count = word_count(&content);
        if self.is_completed() {
            self.summary = summarize(&content);
        }
        self.content = content;
    }
}

/// A book stored in the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedBook {
    pub id: String,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "sinopsis")]
    pub synopsis: String,
    #[serde(rename = "configuracion")]
    pub configuration: BookConfiguration,
    pub outline: Outline,
    #[serde(rename = "capitulos")]
    pub chapters: Vec<Chapter>,
    #[serde(rename = "fechaCreacion")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "fechaModificacion")]
    pub modified_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "palabrasTotales")]
    pub total_words: usize,
    #[serde(rename = "modelo", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Payload of the `create` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBook {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "sinopsis")]
    pub synopsis: String,
    #[serde(rename = "configuracion")]
    pub configuration: BookConfiguration,
    pub outline: Outline,
    #[serde(rename = "capitulos")]
    pub chapters: Vec<Chapter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryStats {
    #[serde(rename = "totalLibros")]
    pub total_books: usize,
    #[serde(rename = "totalPalabras")]
    pub total_words: usize,
    #[serde(rename = "totalCapitulos")]
    pub total_chapters: usize,
    #[serde(rename = "promedioCapitulosPorLibro")]
    pub average_chapters: usize,
    #[serde(rename = "promedioPalabrasPorLibro")]
    pub average_words: usize,
    #[serde(rename = "generoMasComun")]
    pub most_common_genre: String,
}

/// Whitespace-separated token count.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Bounded tail of a chapter used as context for the following chapters.
pub fn summarize(content: &str) -> String {
    let total = content.chars().count();
    if total <= SUMMARY_LIMIT {
        return content.to_string();
    }
    let tail: String = content.chars().skip(total - SUMMARY_LIMIT).collect();
    format!("...{tail}")
}

/// Rough token estimate (four characters per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Rounded completion percentage.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed * 200 + total) / (total * 2)).min(100) as u8
}
