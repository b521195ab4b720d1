//! SQLite-backed book library.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, instrument};

use crate::error::{AppError, Result};
use crate::models::{LibraryStats, NewBook, SavedBook};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS libros (
        id TEXT PRIMARY KEY,
        titulo TEXT NOT NULL,
        sinopsis TEXT NOT NULL,
        configuracion TEXT NOT NULL,
        outline TEXT NOT NULL,
        capitulos TEXT NOT NULL,
        fecha_creacion TEXT NOT NULL,
        fecha_modificacion TEXT NOT NULL,
        palabras_totales INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_libros_fecha_creacion ON libros(fecha_creacion DESC);
";

const COLUMNS: &str = "id, titulo, sinopsis, configuracion, outline, capitulos, \
                       fecha_creacion, fecha_modificacion, palabras_totales";

/// Ordering criteria for [`sort_books`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Newest first.
    #[default]
    Fecha,
    Titulo,
    /// Longest first.
    Palabras,
}

pub struct Library {
    conn: Mutex<Connection>,
}

impl Library {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening library");
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let library = Library {
            conn: Mutex::new(conn),
        };
        library.init()?;
        Ok(library)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::InvalidState("library connection poisoned".to_string()))
    }

    /// Creates the schema if missing. Safe to call repeatedly.
    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        debug!("library schema ready");
        Ok(())
    }

    /// Stores a book. Only completed chapters are kept.
    #[instrument(skip(self, book), fields(title = %book.title))]
    pub fn create(&self, book: NewBook) -> Result<SavedBook> {
        if book.title.trim().is_empty() || book.synopsis.trim().is_empty() {
            return Err(AppError::Configuration(
                "Faltan campos obligatorios".to_string(),
            ));
        }

        let chapters: Vec<_> = book
            .chapters
            .into_iter()
            .filter(|chapter| chapter.is_completed())
            .collect();
        let total_words = chapters.iter().map(|chapter| chapter.word_count).sum();
        let now = Utc::now();

        let saved = SavedBook {
            id: new_id(now),
            title: book.title,
            synopsis: book.synopsis,
            model: book.configuration.model.clone(),
            configuration: book.configuration,
            outline: book.outline,
            chapters,
            created_at: now,
            modified_at: now,
            total_words,
        };

        self.conn()?.execute(
            &format!("INSERT INTO libros ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                saved.id,
                saved.title,
                saved.synopsis,
                serde_json::to_string(&saved.configuration)?,
                serde_json::to_string(&saved.outline)?,
                serde_json::to_string(&saved.chapters)?,
                timestamp(&saved.created_at),
                timestamp(&saved.modified_at),
                saved.total_words as i64,
            ],
        )?;

        info!(id = %saved.id, chapters = saved.chapters.len(), words = saved.total_words, "book saved");
        Ok(saved)
    }

    /// All books, newest first.
    pub fn list(&self) -> Result<Vec<SavedBook>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM libros ORDER BY fecha_creacion DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], read_row)?;
        rows.map(|row| row.map_err(AppError::from)?).collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<SavedBook>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM libros WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Returns whether a book was removed.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM libros WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let mut books = self.list()?;
        books.reverse();
        Ok(compute_stats(&books))
    }

    /// The whole library as pretty-printed JSON.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.list()?)?)
    }
}

fn new_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("libro_{}_{}", now.timestamp_millis(), &suffix[..9])
}

/// Decodes one row. The outer error is SQLite, the inner one bad JSON or dates.
fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<SavedBook>> {
    let configuration: String = row.get(3)?;
    let outline: String = row.get(4)?;
    let chapters: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let modified_at: String = row.get(7)?;
    let total_words: i64 = row.get(8)?;
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let synopsis: String = row.get(2)?;

    Ok((|| -> Result<SavedBook> {
        let configuration: crate::models::BookConfiguration =
            serde_json::from_str(&configuration)?;
        Ok(SavedBook {
            id,
            title,
            synopsis,
            model: configuration.model.clone(),
            configuration,
            outline: serde_json::from_str(&outline)?,
            chapters: serde_json::from_str(&chapters)?,
            created_at: parse_date(&created_at)?,
            modified_at: parse_date(&modified_at)?,
            total_words: total_words.max(0) as usize,
        })
    })())
}

/// Fixed-width so text order matches time order.
fn timestamp(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| AppError::InvalidState(format!("invalid stored date {value:?}: {e}")))
}

/// Aggregates over `books`, given oldest first. Genre ties go to the genre
/// seen first.
pub fn compute_stats(books: &[SavedBook]) -> LibraryStats {
    let total_books = books.len();
    let total_words: usize = books.iter().map(|book| book.total_words).sum();
    let total_chapters: usize = books.iter().map(|book| book.chapters.len()).sum();

    let mut genres: Vec<(&'static str, usize)> = Vec::new();
    for book in books {
        let genre = book.configuration.genre.as_str();
        match genres.iter_mut().find(|(name, _)| *name == genre) {
            Some((_, count)) => *count += 1,
            None => genres.push((genre, 1)),
        }
    }
    let mut most_common: Option<(&str, usize)> = None;
    for &(genre, count) in &genres {
        if most_common.is_none_or(|(_, best)| count > best) {
            most_common = Some((genre, count));
        }
    }

    let average = |total: usize| {
        if total_books == 0 {
            0
        } else {
            (total * 2 + total_books) / (total_books * 2)
        }
    };

    LibraryStats {
        total_books,
        total_words,
        total_chapters,
        average_chapters: average(total_chapters),
        average_words: average(total_words),
        most_common_genre: most_common.map_or("N/A", |(genre, _)| genre).to_string(),
    }
}

/// Case-insensitive substring match on title, synopsis and genre.
pub fn search_books(books: Vec<SavedBook>, query: &str) -> Vec<SavedBook> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return books;
    }
    books
        .into_iter()
        .filter(|book| {
            book.title.to_lowercase().contains(&query)
                || book.synopsis.to_lowercase().contains(&query)
                || book.configuration.genre.as_str().to_lowercase().contains(&query)
        })
        .collect()
}

pub fn sort_books(mut books: Vec<SavedBook>, order: SortOrder) -> Vec<SavedBook> {
    match order {
        SortOrder::Fecha => books.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        SortOrder::Titulo => {
            books.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
        }
        SortOrder::Palabras => books.sort_by(|a, b| b.total_words.cmp(&a.total_words)),
    }
    books
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chapter, ChapterStatus, Genre, fixtures};

    fn chapter(number: u32, content: &str, status: ChapterStatus) -> Chapter {
        let stub = &fixtures::outline(number).chapters[number as usize - 1];
        let mut chapter = Chapter::pending(stub);
        chapter.status = status;
        chapter.set_content(content.to_string());
        chapter
    }

    fn new_book(title: &str, genre: Genre, chapters: Vec<Chapter>) -> NewBook {
        let mut configuration = fixtures::config(chapters.len() as u32);
        configuration.genre = genre;
        NewBook {
            title: title.to_string(),
            synopsis: "Una historia.".to_string(),
            configuration,
            outline: fixtures::outline(chapters.len() as u32),
            chapters,
        }
    }

    #[test]
    fn test_create_keeps_only_completed_chapters() {
        let library = Library::open_in_memory().unwrap();
        let book = library
            .create(new_book(
                "Niebla",
                Genre::Mystery,
                vec![
                    chapter(1, "uno dos tres", ChapterStatus::Completed),
                    chapter(2, "cuatro cinco", ChapterStatus::Error),
                ],
            ))
            .unwrap();

        assert!(book.id.starts_with("libro_"));
        assert_eq!(book.chapters.len(), 1);
        assert_eq!(book.total_words, 3);
        assert_eq!(library.get(&book.id).unwrap(), Some(book));
    }

    #[test]
    fn test_create_requires_title() {
        let library = Library::open_in_memory().unwrap();
        let result = library.create(new_book(" ", Genre::Fantasy, vec![]));
        assert!(matches!(result, Err(AppError::Configuration(_))));
        assert!(library.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_reports_absence() {
        let library = Library::open_in_memory().unwrap();
        let book = library.create(new_book("A", Genre::Romance, vec![])).unwrap();
        assert!(library.delete(&book.id).unwrap());
        assert!(!library.delete(&book.id).unwrap());
        assert_eq!(library.get(&book.id).unwrap(), None);
    }

    #[test]
    fn test_list_is_newest_first() {
        let library = Library::open_in_memory().unwrap();
        let first = library.create(new_book("Primero", Genre::Romance, vec![])).unwrap();
        let second = library.create(new_book("Segundo", Genre::Romance, vec![])).unwrap();
        let ids: Vec<String> = library.list().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn test_stats() {
        let library = Library::open_in_memory().unwrap();
        let empty = library.stats().unwrap();
        assert_eq!(empty.total_books, 0);
        assert_eq!(empty.most_common_genre, "N/A");

        let done = |text: &str| chapter(1, text, ChapterStatus::Completed);
        library
            .create(new_book("A", Genre::Fantasy, vec![done("a b c")]))
            .unwrap();
        library
            .create(new_book("B", Genre::Mystery, vec![done("a b c d")]))
            .unwrap();
        library
            .create(new_book("C", Genre::Mystery, vec![done("a b")]))
            .unwrap();

        let stats = library.stats().unwrap();
        assert_eq!(stats.total_books, 3);
        assert_eq!(stats.total_words, 9);
        assert_eq!(stats.total_chapters, 3);
        assert_eq!(stats.average_chapters, 1);
        assert_eq!(stats.average_words, 3);
        assert_eq!(stats.most_common_genre, "Misterio");
    }

    #[test]
    fn test_search_and_sort() {
        let library = Library::open_in_memory().unwrap();
        let done = |text: &str| chapter(1, text, ChapterStatus::Completed);
        library
            .create(new_book("El faro", Genre::Fantasy, vec![done("uno")]))
            .unwrap();
        library
            .create(new_book("Asesinato", Genre::Mystery, vec![done("uno dos tres")]))
            .unwrap();
        let books = library.list().unwrap();

        let found = search_books(books.clone(), "MISTER");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Asesinato");
        assert_eq!(search_books(books.clone(), "faro")[0].title, "El faro");
        assert_eq!(search_books(books.clone(), "").len(), 2);

        let titles: Vec<String> = sort_books(books.clone(), SortOrder::Titulo)
            .into_iter()
            .map(|b| b.title)
            .collect();
        assert_eq!(titles, vec!["Asesinato", "El faro"]);
        assert_eq!(sort_books(books, SortOrder::Palabras)[0].total_words, 3);
    }

    #[test]
    fn test_books_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libros.db");
        let id = {
            let library = Library::open(&path).unwrap();
            library.create(new_book("Persistente", Genre::Biography, vec![])).unwrap().id
        };
        let library = Library::open(&path).unwrap();
        library.init().unwrap();
        assert_eq!(library.get(&id).unwrap().unwrap().title, "Persistente");

        let exported: serde_json::Value =
            serde_json::from_str(&library.export_json().unwrap()).unwrap();
        assert_eq!(exported[0]["titulo"], "Persistente");
        assert_eq!(exported[0]["configuracion"]["genero"], "Biografía");
    }
}
