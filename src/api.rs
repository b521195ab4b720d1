//! HTTP surface.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Query, State},
    response::{
        Html, IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use futures_util::{Stream, StreamExt};
use http::{StatusCode, header};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{BookConfiguration, GenerationState, NewBook, Outline};
use crate::services::chapter::ChapterClient;
use crate::services::export::{self, ExportFormat, ExportRequest};
use crate::services::library::{self, Library, SortOrder};
use crate::services::llm::LlmProvider;
use crate::services::orchestrator::{Orchestrator, RunEvent};
use crate::services::outline::OutlineClient;
use crate::services::revision::RevisionClient;

const EVENT_BUFFER: usize = 256;

/// JSON body whose rejections answer with the usual error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
struct AppJson<T>(T);

#[derive(Clone)]
struct Session {
    orchestrator: Arc<Mutex<Orchestrator>>,
    snapshot: watch::Receiver<GenerationState>,
    last_used: Instant,
}

impl Session {
    fn is_idle(&self) -> bool {
        self.orchestrator.try_lock().is_ok()
    }
}

#[derive(Clone)]
pub struct AppState {
    provider: Arc<dyn LlmProvider>,
    outline_model: String,
    chapter_model: String,
    library: Arc<Library>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    session_ttl: Duration,
}

impl AppState {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &Config, library: Arc<Library>) -> Self {
        Self {
            provider,
            outline_model: config.outline_model.clone(),
            chapter_model: config.chapter_model.clone(),
            library,
            sessions: Arc::default(),
            session_ttl: config.session_ttl,
        }
    }

    fn outlines(&self) -> OutlineClient {
        OutlineClient::new(self.provider.clone(), self.outline_model.clone())
    }

    fn chapters(&self) -> ChapterClient {
        ChapterClient::new(self.provider.clone(), self.chapter_model.clone())
    }

    fn revisions(&self) -> RevisionClient {
        RevisionClient::new(self.provider.clone(), self.outline_model.clone())
    }

    /// Registers a new session and returns it already locked.
    async fn create_session(&self) -> (String, OwnedMutexGuard<Orchestrator>) {
        let orchestrator = Orchestrator::new(self.outlines(), self.chapters(), self.revisions());
        let snapshot = orchestrator.subscribe();
        let orchestrator = Arc::new(Mutex::new(orchestrator));
        let guard = orchestrator.clone().lock_owned().await;

        let id = uuid::Uuid::new_v4().to_string();
        self.prune_sessions().await;
        self.sessions.write().await.insert(
            id.clone(),
            Session {
                orchestrator,
                snapshot,
                last_used: Instant::now(),
            },
        );
        info!(session = %id, "session created");
        (id, guard)
    }

    async fn session(&self, id: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Sesión {id} no encontrada")))?;
        session.last_used = Instant::now();
        Ok(session.clone())
    }

    /// Drops idle sessions unused for longer than the TTL. Sessions with an
    /// operation in flight are kept.
    pub async fn prune_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let ttl = self.session_ttl;
        sessions.retain(|_, session| session.last_used.elapsed() < ttl || !session.is_idle());
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "pruned idle sessions");
        }
        removed
    }

    async fn remove_session(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("Sesión {id} no encontrada")))?;
        if !session.is_idle() {
            return Err(AppError::Conflict(
                "La sesión tiene una operación en curso".to_string(),
            ));
        }
        sessions.remove(id);
        info!(session = %id, "session removed");
        Ok(())
    }

    /// Locks a session for one operation. Busy sessions are a conflict.
    async fn lock(&self, id: &str) -> Result<OwnedMutexGuard<Orchestrator>> {
        self.session(id)
            .await?
            .orchestrator
            .try_lock_owned()
            .map_err(|_| AppError::Conflict("La sesión tiene una operación en curso".to_string()))
    }
}

/// Prunes idle sessions in the background for the life of the server.
pub fn spawn_session_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    let period = (state.session_ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            state.prune_sessions().await;
        }
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/api/generar-outline", post(generate_outline))
        .route("/api/generar-capitulo", post(generate_chapter))
        .route("/api/revisar-capitulo", post(revise_text))
        .route("/api/mejorar-prompt", post(improve_prompt))
        .route("/api/generar-libro", post(generate_book))
        .route(
            "/api/sesiones/:id",
            get(session_snapshot).delete(delete_session),
        )
        .route(
            "/api/sesiones/:id/capitulos/:numero",
            put(edit_session_chapter),
        )
        .route(
            "/api/sesiones/:id/capitulos/:numero/regenerar",
            post(regenerate_session_chapter),
        )
        .route(
            "/api/sesiones/:id/capitulos/:numero/revisar",
            post(revise_session_chapter),
        )
        .route("/api/sesiones/:id/guardar", post(save_session))
        .route("/api/sesiones/:id/reiniciar", post(reset_session))
        .route(
            "/api/libros",
            get(list_books).post(create_book).delete(delete_book),
        )
        .route("/api/libros/estadisticas", get(library_stats))
        .route("/api/libros/exportar", get(export_library))
        .route("/api/libros/:id", get(get_book))
        .route("/api/init-db", get(init_db))
        .route("/api/exportar/:formato", post(export_book))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Librogen</title>
    <meta charset="utf-8">
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        .info-box { background-color: #f0f8ff; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { background-color: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 4px; font-family: monospace; }
    </style>
</head>
<body>
    <h1>Librogen</h1>

    <div class="info-box">
        <p>Genera libros completos con un modelo de lenguaje: primero un outline, después cada capítulo en orden.</p>
    </div>

    <h2>Endpoints</h2>
    <div class="endpoint">GET /health</div>
    <div class="endpoint">POST /api/generar-outline</div>
    <div class="endpoint">POST /api/generar-capitulo (SSE)</div>
    <div class="endpoint">POST /api/revisar-capitulo</div>
    <div class="endpoint">POST /api/mejorar-prompt</div>
    <div class="endpoint">POST /api/generar-libro (SSE)</div>
    <div class="endpoint">GET | DELETE /api/sesiones/:id</div>
    <div class="endpoint">PUT /api/sesiones/:id/capitulos/:numero</div>
    <div class="endpoint">POST /api/sesiones/:id/capitulos/:numero/regenerar (SSE)</div>
    <div class="endpoint">POST /api/sesiones/:id/capitulos/:numero/revisar</div>
    <div class="endpoint">POST /api/sesiones/:id/guardar</div>
    <div class="endpoint">POST /api/sesiones/:id/reiniciar</div>
    <div class="endpoint">GET | POST | DELETE /api/libros</div>
    <div class="endpoint">GET /api/libros/:id</div>
    <div class="endpoint">GET /api/libros/estadisticas</div>
    <div class="endpoint">GET /api/libros/exportar</div>
    <div class="endpoint">GET /api/init-db</div>
    <div class="endpoint">POST /api/exportar/:formato (txt, md, json, epub, pdf)</div>
</body>
</html>"#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

fn sse_event<T: serde::Serialize>(payload: &T) -> Option<Event> {
    match Event::default().json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "dropping unserializable event");
            None
        }
    }
}

/// Forwards run events until the producing task drops its sender.
fn run_event_stream(
    mut events: mpsc::Receiver<RunEvent>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            if let Some(event) = sse_event(&event) {
                yield Ok::<_, Infallible>(event);
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn generate_outline(
    State(state): State<AppState>,
    AppJson(config): AppJson<BookConfiguration>,
) -> Result<Json<Value>> {
    let outline = state.outlines().generate(&config).await?;
    Ok(Json(json!({ "exito": true, "outline": outline })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterRequest {
    numero_capitulo: u32,
    outline: Outline,
    #[serde(rename = "configuracion")]
    configuration: BookConfiguration,
    #[serde(default)]
    resumenes_anteriores: Vec<String>,
}

async fn generate_chapter(
    State(state): State<AppState>,
    AppJson(request): AppJson<ChapterRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let chapters = state.chapters().stream_chapter(
        request.numero_capitulo,
        &request.outline,
        &request.configuration,
        &request.resumenes_anteriores,
    )?;
    let stream = chapters.filter_map(|event| async move { sse_event(&event).map(Ok::<_, Infallible>) });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionRequest {
    contenido_capitulo: String,
    instrucciones_revision: String,
}

async fn revise_text(
    State(state): State<AppState>,
    AppJson(request): AppJson<RevisionRequest>,
) -> Result<Json<Value>> {
    let content = state
        .revisions()
        .revise(&request.contenido_capitulo, &request.instrucciones_revision)
        .await?;
    Ok(Json(json!({ "exito": true, "contenido": content })))
}

#[derive(Deserialize)]
struct ImproveRequest {
    #[serde(default)]
    prompt: String,
}

async fn improve_prompt(
    State(state): State<AppState>,
    AppJson(request): AppJson<ImproveRequest>,
) -> Result<Json<Value>> {
    let improved = state.revisions().improve_topic(&request.prompt).await?;
    Ok(Json(json!({ "exito": true, "promptMejorado": improved })))
}

async fn generate_book(
    State(state): State<AppState>,
    AppJson(config): AppJson<BookConfiguration>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    config.validate()?;

    let (id, mut orchestrator) = state.create_session().await;
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let _ = tx.send(RunEvent::Sesion { id: id.clone() }).await;

    tokio::spawn(async move {
        if let Err(e) = orchestrator.run(config, &tx).await {
            warn!(session = %id, error = %e, "run ended with error");
        }
        // Release the session before the stream closes.
        drop(orchestrator);
        drop(tx);
    });

    Ok(run_event_stream(rx))
}

async fn session_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GenerationState>> {
    let session = state.session(&id).await?;
    let snapshot = session.snapshot.borrow().clone();
    Ok(Json(snapshot))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.remove_session(&id).await?;
    Ok(Json(json!({ "exito": true })))
}

#[derive(Deserialize)]
struct RegenerateRequest {
    #[serde(rename = "confirmar", default)]
    confirmed: bool,
}

async fn regenerate_session_chapter(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, u32)>,
    AppJson(request): AppJson<RegenerateRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut orchestrator = state.lock(&id).await?;
    orchestrator.check_regeneration(number, request.confirmed)?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(async move {
        if let Err(e) = orchestrator.regenerate_chapter(number, true, &tx).await {
            warn!(session = %id, chapter = number, error = %e, "regeneration failed");
        }
        drop(orchestrator);
        drop(tx);
    });

    Ok(run_event_stream(rx))
}

#[derive(Deserialize)]
struct EditRequest {
    #[serde(rename = "contenido")]
    content: String,
}

async fn edit_session_chapter(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, u32)>,
    AppJson(request): AppJson<EditRequest>,
) -> Result<Json<Value>> {
    let mut orchestrator = state.lock(&id).await?;
    let chapter = orchestrator.edit_chapter(number, request.content)?;
    Ok(Json(json!({ "exito": true, "capitulo": chapter })))
}

#[derive(Deserialize)]
struct SessionRevisionRequest {
    #[serde(rename = "instrucciones")]
    instructions: String,
}

async fn revise_session_chapter(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, u32)>,
    AppJson(request): AppJson<SessionRevisionRequest>,
) -> Result<Json<Value>> {
    let mut orchestrator = state.lock(&id).await?;
    let chapter = orchestrator
        .revise_chapter(number, &request.instructions)
        .await?;
    Ok(Json(json!({ "exito": true, "capitulo": chapter })))
}

async fn save_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let mut orchestrator = state.lock(&id).await?;
    let book = orchestrator.save(&state.library)?;
    Ok(Json(json!({ "exito": true, "libro": book })))
}

async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let mut orchestrator = state.lock(&id).await?;
    orchestrator.reset();
    Ok(Json(json!({ "exito": true, "estado": orchestrator.state() })))
}

#[derive(Deserialize)]
struct ListQuery {
    q: Option<String>,
    #[serde(default)]
    orden: SortOrder,
}

async fn list_books(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>> {
    let mut books = state.library.list()?;
    if let Some(q) = &query.q {
        books = library::search_books(books, q);
    }
    let books = library::sort_books(books, query.orden);
    Ok(Json(json!({ "exito": true, "libros": books })))
}

async fn create_book(
    State(state): State<AppState>,
    AppJson(book): AppJson<NewBook>,
) -> Result<Json<Value>> {
    let book = state.library.create(book)?;
    Ok(Json(json!({ "exito": true, "libro": book })))
}

#[derive(Deserialize)]
struct DeleteQuery {
    id: Option<String>,
}

async fn delete_book(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>> {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return Err(AppError::Configuration(
            "ID de libro no proporcionado".to_string(),
        ));
    };
    if !state.library.delete(&id)? {
        return Err(AppError::NotFound("Libro no encontrado".to_string()));
    }
    Ok(Json(json!({ "exito": true })))
}

async fn get_book(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let book = state
        .library
        .get(&id)?
        .ok_or_else(|| AppError::NotFound("Libro no encontrado".to_string()))?;
    Ok(Json(json!({ "exito": true, "libro": book })))
}

async fn library_stats(State(state): State<AppState>) -> Result<Json<Value>> {
    let stats = state.library.stats()?;
    Ok(Json(json!({ "exito": true, "estadisticas": stats })))
}

async fn export_library(State(state): State<AppState>) -> Result<Response> {
    let body = state.library.export_json()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"biblioteca.json\"".to_string(),
            ),
        ],
        body,
    )
        .into_response())
}

async fn init_db(State(state): State<AppState>) -> Result<Json<Value>> {
    state.library.init()?;
    Ok(Json(
        json!({ "exito": true, "mensaje": "Base de datos inicializada" }),
    ))
}

async fn export_book(
    Path(format): Path<String>,
    AppJson(request): AppJson<ExportRequest>,
) -> Result<Response> {
    let format: ExportFormat = format.parse()?;
    let file = tokio::task::spawn_blocking(move || export::export(format, request))
        .await
        .map_err(|e| AppError::Export(format!("export task failed: {e}")))??;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, file.mime_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file.filename),
            ),
        ],
        file.bytes,
    )
        .into_response())
}
