//! Run state of one generation session and the closed set of transitions
//! that may change it.

use serde::{Deserialize, Serialize};

use super::{BookConfiguration, Chapter, ChapterStatus, Outline, progress_percent, word_count};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "configuracion")]
    Configuring,
    #[serde(rename = "generando-outline")]
    GeneratingOutline,
    #[serde(rename = "generando-capitulos")]
    GeneratingChapters,
    #[serde(rename = "completado")]
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationState {
    #[serde(rename = "etapa")]
    pub stage: Stage,
    #[serde(rename = "configuracion")]
    pub configuration: Option<BookConfiguration>,
    pub outline: Option<Outline>,
    #[serde(rename = "capitulos")]
    pub chapters: Vec<Chapter>,
    #[serde(rename = "capituloActual")]
    pub current_chapter: u32,
    #[serde(rename = "progreso")]
    pub progress: u8,
    pub error: Option<String>,
    #[serde(rename = "generando")]
    pub generating: bool,
}

#[derive(Debug, Clone)]
pub enum Action {
    StartOutline(BookConfiguration),
    OutlineCompleted(Outline),
    StartChapter(u32),
    /// Regeneration: clears the chapter before streaming it again.
    RestartChapter(u32),
    AppendChunk { number: u32, text: String },
    ChapterCompleted { number: u32, content: String, summary: String },
    ChapterFailed(u32),
    EditChapter { number: u32, content: String },
    Fail(String),
    /// Ends a single-chapter operation outside the main run.
    Settle,
    Reset,
}

impl Default for GenerationState {
    fn default() -> Self {
        GenerationState {
            stage: Stage::Configuring,
            configuration: None,
            outline: None,
            chapters: Vec::new(),
            current_chapter: 0,
            progress: 0,
            error: None,
            generating: false,
        }
    }
}

impl GenerationState {
    pub fn chapter(&self, number: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|chapter| chapter.number == number)
    }

    fn chapter_mut(&mut self, number: u32) -> Option<&mut Chapter> {
        self.chapters.iter_mut().find(|chapter| chapter.number == number)
    }

    pub fn completed_count(&self) -> usize {
        self.chapters.iter().filter(|c| c.is_completed()).count()
    }

    pub fn total_words(&self) -> usize {
        self.chapters
            .iter()
            .filter(|c| c.is_completed())
            .map(|c| c.word_count)
            .sum()
    }

    /// Summaries of the completed chapters numbered below `number`, in order.
    pub fn prior_summaries(&self, number: u32) -> Vec<String> {
        let mut prior: Vec<&Chapter> = self
            .chapters
            .iter()
            .filter(|c| c.number < number && c.is_completed())
            .collect();
        prior.sort_by_key(|c| c.number);
        prior.into_iter().map(|c| c.summary.clone()).collect()
    }

    fn recompute_progress(&mut self) {
        self.progress = progress_percent(self.completed_count(), self.chapters.len());
    }

    /// Applies one transition. Unknown chapter numbers leave the state as is.
    pub fn apply(&mut self, action: Action) {
        match action {
            Action::StartOutline(configuration) => {
                *self = GenerationState {
                    stage: Stage::GeneratingOutline,
                    configuration: Some(configuration),
                    generating: true,
                    ..GenerationState::default()
                };
            }
            Action::OutlineCompleted(outline) => {
                self.stage = Stage::GeneratingChapters;
                self.chapters = outline.chapters.iter().map(Chapter::pending).collect();
                self.outline = Some(outline);
                self.current_chapter = 1;
                self.progress = 0;
            }
            Action::StartChapter(number) => {
                self.current_chapter = number;
                if let Some(chapter) = self.chapter_mut(number) {
                    chapter.status = ChapterStatus::Generating;
                }
            }
            Action::RestartChapter(number) => {
                self.current_chapter = number;
                self.error = None;
                self.generating = true;
                if let Some(chapter) = self.chapter_mut(number) {
                    chapter.status = ChapterStatus::Generating;
                    chapter.content.clear();
                    chapter.summary.clear();
                    chapter.word_count = 0;
                }
                self.recompute_progress();
            }
            Action::AppendChunk { number, text } => {
                if let Some(chapter) = self.chapter_mut(number) {
                    chapter.content.push_str(&text);
                    chapter.word_count = word_count(&chapter.content);
                }
            }
            Action::ChapterCompleted {
                number,
                content,
                summary,
            } => {
                if let Some(chapter) = self.chapter_mut(number) {
                    chapter.word_count = word_count(&content);
                    chapter.content = content;
                    chapter.summary = summary;
                    chapter.status = ChapterStatus::Completed;
                }
                let all_completed = self.chapters.iter().all(|c| c.is_completed());
                if all_completed {
                    self.stage = Stage::Completed;
                }
                self.generating = !all_completed;
                self.recompute_progress();
            }
            Action::ChapterFailed(number) => {
                if let Some(chapter) = self.chapter_mut(number) {
                    chapter.status = ChapterStatus::Error;
                    chapter.content.clear();
                    chapter.summary.clear();
                    chapter.word_count = 0;
                }
            }
            Action::EditChapter { number, content } => {
                if let Some(chapter) = self.chapter_mut(number) {
                    chapter.set_content(content);
                }
            }
            Action::Fail(message) => {
                self.error = Some(message);
                self.generating = false;
            }
            Action::Settle => self.generating = false,
            Action::Reset => *self = GenerationState::default(),
        }
    }
}
