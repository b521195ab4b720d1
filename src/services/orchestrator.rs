//! Drives a generation session: outline, then every chapter in order, with
//! regeneration, edits and revisions afterwards.
//!
//! The orchestrator is the only writer of its [`GenerationState`]. Every
//! change goes through [`Action`]s; observers get snapshots through a
//! `watch` channel and live progress through an `mpsc` channel of
//! [`RunEvent`]s.

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use crate::error::{AppError, Result};
use crate::models::{
    Action, BookConfiguration, Chapter, GenerationState, NewBook, Outline, SavedBook, Stage,
    summarize,
};
use crate::services::chapter::{ChapterClient, ChapterEvent};
use crate::services::library::Library;
use crate::services::outline::OutlineClient;
use crate::services::revision::RevisionClient;

/// Progress notifications published while a run or regeneration is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tipo", rename_all = "camelCase")]
pub enum RunEvent {
    Sesion {
        id: String,
    },
    Etapa {
        etapa: Stage,
    },
    Outline {
        outline: Outline,
    },
    CapituloIniciado {
        numero: u32,
    },
    Chunk {
        numero: u32,
        contenido: String,
    },
    CapituloCompletado {
        numero: u32,
        palabras: usize,
        resumen: String,
    },
    Progreso {
        progreso: u8,
    },
    Completado {
        #[serde(rename = "palabrasTotales")]
        palabras_totales: usize,
    },
    Error {
        contenido: String,
    },
}

pub type EventSender = mpsc::Sender<RunEvent>;

pub struct Orchestrator {
    outlines: OutlineClient,
    chapters: ChapterClient,
    revisions: RevisionClient,
    state: GenerationState,
    snapshots: watch::Sender<GenerationState>,
    saved_as: Option<String>,
}

impl Orchestrator {
    pub fn new(outlines: OutlineClient, chapters: ChapterClient, revisions: RevisionClient) -> Self {
        let (snapshots, _) = watch::channel(GenerationState::default());
        Self {
            outlines,
            chapters,
            revisions,
            state: GenerationState::default(),
            snapshots,
            saved_as: None,
        }
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.snapshots.subscribe()
    }

    fn dispatch(&mut self, action: Action) {
        let publish = !matches!(action, Action::AppendChunk { .. });
        self.state.apply(action);
        if publish {
            self.snapshots.send_replace(self.state.clone());
        }
    }

    /// Records a failure in the run state and notifies observers.
    async fn fail(&mut self, error: AppError, events: &EventSender) -> AppError {
        error!(error = %error, stage = ?self.state.stage, "generation failed");
        self.dispatch(Action::Fail(error.to_string()));
        emit(
            events,
            RunEvent::Error {
                contenido: error.to_string(),
            },
        )
        .await;
        error
    }

    /// Runs the whole pipeline for `config`.
    ///
    /// Chapters are generated strictly in order, one at a time, since each
    /// prompt carries the summaries of all earlier chapters. The first failure
    /// ends the run; chapters completed before it stay in the state.
    #[instrument(skip(self, config, events), fields(chapters = config.chapter_count))]
    pub async fn run(&mut self, config: BookConfiguration, events: &EventSender) -> Result<()> {
        if self.state.stage != Stage::Configuring {
            return Err(AppError::Conflict(
                "La sesión ya tiene una generación; reiníciala primero".to_string(),
            ));
        }
        config.validate()?;

        self.dispatch(Action::StartOutline(config.clone()));
        emit(events, RunEvent::Etapa { etapa: Stage::GeneratingOutline }).await;

        let generated = self
            .outlines
            .generate(&config)
            .await
            .and_then(|outline| accept_outline(outline, config.chapter_count));
        let outline = match generated {
            Ok(outline) => outline,
            Err(e) => return Err(self.fail(e, events).await),
        };

        self.dispatch(Action::OutlineCompleted(outline.clone()));
        emit(events, RunEvent::Outline { outline: outline.clone() }).await;
        emit(events, RunEvent::Etapa { etapa: Stage::GeneratingChapters }).await;

        let mut summaries: Vec<String> = Vec::with_capacity(outline.chapters.len());
        for number in 1..=outline.chapters.len() as u32 {
            self.dispatch(Action::StartChapter(number));
            let summary = self
                .generate_chapter(number, &outline, &config, &summaries, events)
                .await?;
            summaries.push(summary);
        }

        let total_words = self.state.total_words();
        info!(total_words, "run completed");
        emit(events, RunEvent::Etapa { etapa: Stage::Completed }).await;
        emit(
            events,
            RunEvent::Completado {
                palabras_totales: total_words,
            },
        )
        .await;
        Ok(())
    }

    /// Streams one chapter into the state and returns its summary.
    async fn generate_chapter(
        &mut self,
        number: u32,
        outline: &Outline,
        config: &BookConfiguration,
        summaries: &[String],
        events: &EventSender,
    ) -> Result<String> {
        emit(events, RunEvent::CapituloIniciado { numero: number }).await;

        let mut stream = match self.chapters.stream_chapter(number, outline, config, summaries) {
            Ok(stream) => stream,
            Err(e) => {
                self.dispatch(Action::ChapterFailed(number));
                return Err(self.fail(e, events).await);
            }
        };

        let mut accumulated = String::new();
        while let Some(event) = stream.next().await {
            match event {
                ChapterEvent::Chunk(text) => {
                    accumulated.push_str(&text);
                    self.dispatch(Action::AppendChunk {
                        number,
                        text: text.clone(),
                    });
                    emit(
                        events,
                        RunEvent::Chunk {
                            numero: number,
                            contenido: text,
                        },
                    )
                    .await;
                }
                ChapterEvent::Complete(full_text) => {
                    if full_text != accumulated {
                        warn!(chapter = number, "final text differs from streamed chunks");
                    }
                    let summary = summarize(&full_text);
                    self.dispatch(Action::ChapterCompleted {
                        number,
                        content: full_text,
                        summary: summary.clone(),
                    });
                    let words = self.state.chapter(number).map_or(0, |c| c.word_count);
                    emit(
                        events,
                        RunEvent::CapituloCompletado {
                            numero: number,
                            palabras: words,
                            resumen: summary.clone(),
                        },
                    )
                    .await;
                    emit(
                        events,
                        RunEvent::Progreso {
                            progreso: self.state.progress,
                        },
                    )
                    .await;
                    return Ok(summary);
                }
                ChapterEvent::Error(message) => {
                    self.dispatch(Action::ChapterFailed(number));
                    return Err(self.fail(AppError::Stream(message), events).await);
                }
            }
        }

        self.dispatch(Action::ChapterFailed(number));
        let error = AppError::Stream(format!(
            "El capítulo {number} terminó sin evento final"
        ));
        Err(self.fail(error, events).await)
    }

    /// Fails when [`Self::regenerate_chapter`] would be refused before
    /// touching the state.
    pub fn check_regeneration(&self, number: u32, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(AppError::Configuration(
                "Regenerar descarta el contenido actual del capítulo; confirma la operación"
                    .to_string(),
            ));
        }
        self.generated_book()?;
        self.chapter(number)?;
        Ok(())
    }

    /// Discards chapter `number` and streams it again.
    ///
    /// Destructive: the previous content is lost, so callers must pass
    /// `confirmed = true`.
    #[instrument(skip(self, events))]
    pub async fn regenerate_chapter(
        &mut self,
        number: u32,
        confirmed: bool,
        events: &EventSender,
    ) -> Result<()> {
        self.check_regeneration(number, confirmed)?;
        let (outline, config) = self.generated_book()?;

        let summaries = self.state.prior_summaries(number);
        self.dispatch(Action::RestartChapter(number));
        emit(
            events,
            RunEvent::Progreso {
                progreso: self.state.progress,
            },
        )
        .await;

        self.generate_chapter(number, &outline, &config, &summaries, events)
            .await?;
        self.dispatch(Action::Settle);
        info!(chapter = number, "chapter regenerated");
        Ok(())
    }

    /// Replaces a chapter's text directly. Its status is left unchanged.
    pub fn edit_chapter(&mut self, number: u32, content: String) -> Result<&Chapter> {
        if self.state.generating {
            return Err(AppError::Conflict("Hay una generación en curso".to_string()));
        }
        self.chapter(number)?;
        self.dispatch(Action::EditChapter { number, content });
        self.chapter(number)
    }

    /// Asks the model to rewrite a chapter and applies the answer as an edit.
    #[instrument(skip(self, instructions))]
    pub async fn revise_chapter(&mut self, number: u32, instructions: &str) -> Result<&Chapter> {
        if self.state.generating {
            return Err(AppError::Conflict("Hay una generación en curso".to_string()));
        }
        let content = self.chapter(number)?.content.clone();
        let revised = self.revisions.revise(&content, instructions).await?;
        self.edit_chapter(number, revised)
    }

    pub fn reset(&mut self) {
        self.saved_as = None;
        self.dispatch(Action::Reset);
    }

    /// Stores the finished book. Allowed once per completed run.
    #[instrument(skip(self, library))]
    pub fn save(&mut self, library: &Library) -> Result<SavedBook> {
        if self.state.stage != Stage::Completed {
            return Err(AppError::Conflict(
                "Solo se puede guardar un libro completado".to_string(),
            ));
        }
        if let Some(id) = &self.saved_as {
            return Err(AppError::Conflict(format!(
                "El libro ya fue guardado con id {id}"
            )));
        }
        let (outline, config) = self.generated_book()?;

        let book = library.create(NewBook {
            title: outline.title.clone(),
            synopsis: outline.synopsis.clone(),
            configuration: config,
            outline,
            chapters: self.state.chapters.clone(),
        })?;
        self.saved_as = Some(book.id.clone());
        Ok(book)
    }

    fn chapter(&self, number: u32) -> Result<&Chapter> {
        self.state
            .chapter(number)
            .ok_or_else(|| AppError::NotFound(format!("No existe el capítulo {number}")))
    }

    fn generated_book(&self) -> Result<(Outline, BookConfiguration)> {
        match (&self.state.outline, &self.state.configuration) {
            (Some(outline), Some(config)) if !self.state.generating => {
                Ok((outline.clone(), config.clone()))
            }
            (Some(_), Some(_)) => Err(AppError::Conflict("Hay una generación en curso".to_string())),
            _ => Err(AppError::Conflict(
                "La sesión todavía no tiene un outline".to_string(),
            )),
        }
    }
}

/// Renumbers stubs by position and keeps at most `requested` of them.
fn accept_outline(mut outline: Outline, requested: u32) -> Result<Outline> {
    if outline.chapters.is_empty() {
        return Err(AppError::UpstreamParse(
            "El outline no contiene capítulos".to_string(),
        ));
    }
    if outline.chapters.len() != requested as usize {
        warn!(
            requested,
            received = outline.chapters.len(),
            "generating the chapters the outline provides"
        );
    }
    outline.chapters.truncate(requested as usize);
    for (index, stub) in outline.chapters.iter_mut().enumerate() {
        stub.number = index as u32 + 1;
    }
    Ok(outline)
}

/// Observers may disconnect at any time; the run continues without them.
async fn emit(events: &EventSender, event: RunEvent) {
    let _ = events.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChapterStatus, MAX_CHAPTERS, fixtures, word_count};
    use crate::services::testing::FakeProvider;
    use std::sync::Arc;

    fn orchestrator(provider: &Arc<FakeProvider>) -> Orchestrator {
        Orchestrator::new(
            OutlineClient::new(provider.clone(), "outline"),
            ChapterClient::new(provider.clone(), "chapter"),
            RevisionClient::new(provider.clone(), "outline"),
        )
    }

    fn script_run(provider: &FakeProvider, chapters: u32) {
        provider.push_completion(format!(
            "Claro, aquí está:\n{}",
            serde_json::to_string(&fixtures::outline(chapters)).unwrap()
        ));
        for n in 1..=chapters {
            provider.push_stream([format!("Capítulo {n} empieza. "), format!("Y termina {n}.")]);
        }
    }

    async fn drain(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn run(orch: &mut Orchestrator, chapters: u32) -> (Result<()>, Vec<RunEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        let result = orch.run(fixtures::config(chapters), &tx).await;
        drop(tx);
        (result, drain(rx).await)
    }

    fn started_chapters(events: &[RunEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::CapituloIniciado { numero } => Some(*numero),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_run_generates_every_chapter_in_order() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 3);
        let mut orch = orchestrator(&provider);

        let (result, events) = run(&mut orch, 3).await;
        result.unwrap();

        assert_eq!(started_chapters(&events), vec![1, 2, 3]);
        let state = orch.state();
        assert_eq!(state.stage, Stage::Completed);
        assert_eq!(state.progress, 100);
        assert!(!state.generating);
        let numbers: Vec<u32> = state.chapters.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(state.chapters.iter().all(|c| c.status == ChapterStatus::Completed));
        assert_eq!(state.chapter(2).unwrap().content, "Capítulo 2 empieza. Y termina 2.");
    }

    #[tokio::test]
    async fn test_run_covers_the_whole_chapter_range() {
        for chapters in 1..=MAX_CHAPTERS {
            let provider = Arc::new(FakeProvider::new());
            script_run(&provider, chapters);
            let mut orch = orchestrator(&provider);

            let (result, events) = run(&mut orch, chapters).await;
            result.unwrap();

            let expected: Vec<u32> = (1..=chapters).collect();
            assert_eq!(started_chapters(&events), expected);
            let state = orch.state();
            let numbers: Vec<u32> = state.chapters.iter().map(|c| c.number).collect();
            assert_eq!(numbers, expected, "{chapters} chapters");
            assert!(state.chapters.iter().all(|c| c.status == ChapterStatus::Completed));
            assert_eq!(state.progress, 100);
            assert_eq!(state.stage, Stage::Completed);
        }
    }

    #[tokio::test]
    async fn test_chapter_starts_only_after_previous_completes() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 3);
        let mut orch = orchestrator(&provider);
        let (_, events) = run(&mut orch, 3).await;

        let mut open: Option<u32> = None;
        for event in &events {
            match event {
                RunEvent::CapituloIniciado { numero } => {
                    assert!(open.is_none(), "chapter {numero} started while {open:?} open");
                    open = Some(*numero);
                }
                RunEvent::CapituloCompletado { numero, .. } => {
                    assert_eq!(open, Some(*numero));
                    open = None;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_second_prompt_carries_first_summary() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 2);
        let mut orch = orchestrator(&provider);
        let (result, _) = run(&mut orch, 2).await;
        result.unwrap();

        let summary = orch.state().chapter(1).unwrap().summary.clone();
        assert_eq!(summary, "Capítulo 1 empieza. Y termina 1.");
        let prompts = provider.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(!prompts[1].contains(&summary));
        assert!(prompts[2].contains(&summary));
    }

    #[tokio::test]
    async fn test_saved_book_word_total() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 2);
        let mut orch = orchestrator(&provider);
        let (result, events) = run(&mut orch, 2).await;
        result.unwrap();

        let library = Library::open_in_memory().unwrap();
        let book = orch.save(&library).unwrap();
        let expected: usize = orch.state().chapters.iter().map(|c| word_count(&c.content)).sum();
        assert_eq!(book.total_words, expected);
        assert_eq!(book.chapters.len(), 2);
        assert!(events.contains(&RunEvent::Completado { palabras_totales: expected }));
        assert!(matches!(orch.save(&library), Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_stream_error_aborts_run_and_keeps_completed_chapters() {
        let provider = Arc::new(FakeProvider::new());
        provider.push_completion(serde_json::to_string(&fixtures::outline(3)).unwrap());
        provider.push_stream(["Primer capítulo."]);
        provider.push_stream_items(vec![
            Ok("A medias".into()),
            Err(AppError::Stream("overloaded".into())),
        ]);
        let mut orch = orchestrator(&provider);

        let (result, events) = run(&mut orch, 3).await;
        assert!(matches!(result, Err(AppError::Stream(_))));
        assert_eq!(started_chapters(&events), vec![1, 2]);
        assert!(events.contains(&RunEvent::Error { contenido: "overloaded".into() }));

        let state = orch.state();
        assert_eq!(state.error.as_deref(), Some("overloaded"));
        assert!(!state.generating);
        assert_eq!(state.chapter(1).unwrap().status, ChapterStatus::Completed);
        assert_eq!(state.chapter(2).unwrap().status, ChapterStatus::Error);
        assert_eq!(state.chapter(2).unwrap().content, "");
        assert_eq!(state.chapter(2).unwrap().word_count, 0);
        assert_eq!(state.chapter(3).unwrap().status, ChapterStatus::Pending);
        assert_eq!(provider.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_outline_failure_ends_run() {
        let provider = Arc::new(FakeProvider::new());
        provider.push_completion("No tengo JSON para ti");
        let mut orch = orchestrator(&provider);

        let (result, _) = run(&mut orch, 2).await;
        assert!(matches!(result, Err(AppError::UpstreamParse(_))));
        assert_eq!(orch.state().stage, Stage::GeneratingOutline);
        assert!(orch.state().error.is_some());
        assert!(orch.state().chapters.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_without_network() {
        let provider = Arc::new(FakeProvider::new());
        let mut orch = orchestrator(&provider);
        let (tx, _rx) = mpsc::channel(8);
        let mut config = fixtures::config(2);
        config.chapter_count = 0;
        assert!(matches!(
            orch.run(config, &tx).await,
            Err(AppError::Configuration(_))
        ));
        assert_eq!(orch.state().stage, Stage::Configuring);
        assert!(provider.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_short_outline_generates_what_it_has() {
        let provider = Arc::new(FakeProvider::new());
        let mut outline = fixtures::outline(2);
        outline.chapters[0].number = 7;
        outline.chapters[1].number = 7;
        provider.push_completion(serde_json::to_string(&outline).unwrap());
        provider.push_stream(["uno"]);
        provider.push_stream(["dos"]);
        let mut orch = orchestrator(&provider);

        let (result, _) = run(&mut orch, 3).await;
        result.unwrap();
        let numbers: Vec<u32> = orch.state().chapters.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(orch.state().stage, Stage::Completed);
    }

    #[tokio::test]
    async fn test_regeneration_touches_only_target_chapter() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 3);
        let mut orch = orchestrator(&provider);
        let (result, _) = run(&mut orch, 3).await;
        result.unwrap();

        let before = orch.state().clone();
        provider.push_stream(["Versión ", "nueva."]);
        let (tx, rx) = mpsc::channel(64);
        orch.regenerate_chapter(2, true, &tx).await.unwrap();
        drop(tx);
        let events = drain(rx).await;

        let state = orch.state();
        assert_eq!(state.chapter(2).unwrap().content, "Versión nueva.");
        assert_eq!(state.chapter(1), before.chapter(1));
        assert_eq!(state.chapter(3), before.chapter(3));
        assert_eq!(state.progress, 100);
        assert_eq!(state.stage, Stage::Completed);
        assert_eq!(started_chapters(&events), vec![2]);

        let prompt = provider.prompts().pop().unwrap();
        let first = &before.chapter(1).unwrap().summary;
        let third = &before.chapter(3).unwrap().summary;
        assert!(prompt.contains(&format!("Capítulo 1:\n{first}")));
        assert!(!prompt.contains(third.as_str()));
        assert_eq!(orch.state().prior_summaries(2), vec![first.clone()]);
    }

    #[tokio::test]
    async fn test_regeneration_requires_confirmation() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 1);
        let mut orch = orchestrator(&provider);
        run(&mut orch, 1).await.0.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let content = orch.state().chapter(1).unwrap().content.clone();
        assert!(matches!(
            orch.regenerate_chapter(1, false, &tx).await,
            Err(AppError::Configuration(_))
        ));
        assert_eq!(orch.state().chapter(1).unwrap().content, content);
        assert!(matches!(
            orch.regenerate_chapter(9, true, &tx).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_and_revise_keep_status() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 1);
        let mut orch = orchestrator(&provider);
        run(&mut orch, 1).await.0.unwrap();

        let chapter = orch.edit_chapter(1, "Texto editado a mano".into()).unwrap();
        assert_eq!(chapter.status, ChapterStatus::Completed);
        assert_eq!(chapter.word_count, 4);

        provider.push_completion("Texto revisado por el modelo ahora");
        let chapter = orch.revise_chapter(1, "Más dramático").await.unwrap();
        assert_eq!(chapter.content, "Texto revisado por el modelo ahora");
        assert_eq!(chapter.word_count, 6);
        assert_eq!(chapter.status, ChapterStatus::Completed);
        assert!(provider.prompts().last().unwrap().contains("Texto editado a mano"));
    }

    #[tokio::test]
    async fn test_reset_allows_new_run_and_snapshots_follow() {
        let provider = Arc::new(FakeProvider::new());
        script_run(&provider, 1);
        let mut orch = orchestrator(&provider);
        let snapshots = orch.subscribe();
        run(&mut orch, 1).await.0.unwrap();
        assert_eq!(snapshots.borrow().stage, Stage::Completed);

        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            orch.run(fixtures::config(1), &tx).await,
            Err(AppError::Conflict(_))
        ));

        orch.reset();
        assert_eq!(snapshots.borrow().stage, Stage::Configuring);
        script_run(&provider, 1);
        run(&mut orch, 1).await.0.unwrap();
        assert_eq!(orch.state().stage, Stage::Completed);
    }

    #[test]
    fn test_run_event_wire_format() {
        let value = serde_json::to_value(RunEvent::CapituloIniciado { numero: 2 }).unwrap();
        assert_eq!(value, serde_json::json!({"tipo": "capituloIniciado", "numero": 2}));
        let value = serde_json::to_value(RunEvent::Completado { palabras_totales: 10 }).unwrap();
        assert_eq!(value["palabrasTotales"], 10);
    }
}
