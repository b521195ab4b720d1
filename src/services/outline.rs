use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, Result};
use crate::models::{BookConfiguration, ChapterStub, Character, Outline, estimate_tokens};
use crate::services::llm::{CompletionRequest, LlmProvider};
use crate::services::prompts;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());
static OUTSIDE_LATIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\x20-\x7E\u{00A0}-\u{00FF}]").unwrap());

pub struct OutlineClient {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl OutlineClient {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    #[instrument(skip(self, config), fields(chapters = config.chapter_count, genre = %config.genre))]
    pub async fn generate(&self, config: &BookConfiguration) -> Result<Outline> {
        config.validate()?;

        let prompt = prompts::outline_prompt(config);
        debug!(tokens = estimate_tokens(&prompt), "built outline prompt");

        let text = self
            .provider
            .complete(CompletionRequest {
                model: config.model.clone().unwrap_or_else(|| self.model.clone()),
                prompt,
                max_tokens: 4000,
                temperature: Some(1.0),
            })
            .await?;

        let outline = parse_outline(&text)?;
        if outline.chapters.len() != config.chapter_count as usize {
            warn!(
                requested = config.chapter_count,
                received = outline.chapters.len(),
                "outline chapter count differs from request"
            );
        }
        info!(title = %outline.title, chapters = outline.chapters.len(), "outline generated");
        Ok(outline)
    }
}

/// Extracts and repairs the outline JSON embedded in a model answer.
pub fn parse_outline(raw: &str) -> Result<Outline> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(AppError::UpstreamParse(
            "No se encontró JSON en la respuesta".to_string(),
        ));
    };

    let mut candidate = if end > start {
        raw[start..=end].to_string()
    } else {
        raw[start..].to_string()
    };

    let open_braces = candidate.matches('{').count();
    let close_braces = candidate.matches('}').count();
    if close_braces < open_braces {
        // Truncated answer: the real end is the end of the text.
        candidate = raw[start..].trim_end().to_string();
        candidate.push_str(&missing_closers(&candidate));
    }

    let normalized = normalize(&candidate);
    let value: Value = match serde_json::from_str(&normalized) {
        Ok(value) => value,
        Err(first) => {
            debug!(error = %first, "outline JSON invalid, retrying with stripped characters");
            let stripped = OUTSIDE_LATIN.replace_all(&normalized, "");
            serde_json::from_str(&stripped).map_err(|e| {
                AppError::UpstreamParse(format!("El modelo produjo JSON inválido: {e}"))
            })?
        }
    };

    outline_from_value(&value)
}

/// Closers for every bracket still open at the end of `text`, innermost first.
fn missing_closers(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    stack.into_iter().rev().collect()
}

fn normalize(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text, " ");
    let without_commas = TRAILING_COMMA.replace_all(&collapsed, "$1");
    without_commas
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

fn clean(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

fn text_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).map(clean).unwrap_or_default()
}

fn outline_from_value(value: &Value) -> Result<Outline> {
    let title = text_field(value, "titulo");
    let synopsis = text_field(value, "sinopsis");
    let chapters = value.get("capitulos").and_then(Value::as_array);

    let (false, false, Some(chapters)) = (title.is_empty(), synopsis.is_empty(), chapters) else {
        return Err(AppError::UpstreamParse(
            "Estructura de outline inválida".to_string(),
        ));
    };

    let chapters = chapters
        .iter()
        .enumerate()
        .map(|(index, entry)| ChapterStub {
            number: entry
                .get("numero")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(index as u32 + 1),
            title: text_field(entry, "titulo"),
            description: text_field(entry, "descripcion"),
        })
        .collect();

    let characters = value
        .get("personajes")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| entry.is_object())
                .map(|entry| Character {
                    name: text_field(entry, "nombre"),
                    description: text_field(entry, "descripcion"),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Outline {
        title,
        synopsis,
        chapters,
        characters,
        narrative_arc: text_field(value, "arcoNarrativo"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use crate::services::testing::FakeProvider;

    #[test]
    fn test_repairs_missing_closing_brace() {
        let raw = "noise {\"titulo\":\"A\",\"sinopsis\":\"B\",\"capitulos\":[{\"numero\":1,\"titulo\":\"C\",\"descripcion\":\"D\"}]";
        let outline = parse_outline(raw).unwrap();
        assert_eq!(outline.title, "A");
        assert_eq!(outline.chapters.len(), 1);
        assert_eq!(outline.chapters[0].title, "C");
        assert!(outline.characters.is_empty());
    }

    #[test]
    fn test_no_brace_is_parse_error() {
        let err = parse_outline("Lo siento, no puedo ayudar con eso.").unwrap_err();
        assert!(matches!(err, AppError::UpstreamParse(_)));
    }

    #[test]
    fn test_prose_and_fences_are_ignored() {
        let raw = "Aquí tienes el esquema:\n```json\n{\n  \"titulo\": \"El faro\",\n  \"sinopsis\": \"Una   guardiana\n del faro.\",\n  \"capitulos\": [\n    {\"numero\": 1, \"titulo\": \" Llegada \", \"descripcion\": \"Ella llega.\"},\n  ],\n  \"personajes\": [{\"nombre\": \"Inés\", \"descripcion\": \"Guardiana\"}],\n  \"arcoNarrativo\": \"Soledad y rescate\"\n}\n```\nEspero que te guste.";
        let outline = parse_outline(raw).unwrap();
        assert_eq!(outline.title, "El faro");
        assert_eq!(outline.synopsis, "Una guardiana del faro.");
        assert_eq!(outline.chapters[0].title, "Llegada");
        assert_eq!(outline.characters[0].name, "Inés");
        assert_eq!(outline.narrative_arc, "Soledad y rescate");
    }

    #[test]
    fn test_smart_quotes_are_normalized() {
        let raw = "{\u{201C}titulo\u{201D}: \u{201C}A\u{201D}, \"sinopsis\": \"B\", \"capitulos\": []}";
        let outline = parse_outline(raw).unwrap();
        assert_eq!(outline.title, "A");
        assert!(outline.chapters.is_empty());
    }

    #[test]
    fn test_characters_outside_latin_range_are_stripped_on_retry() {
        let raw = "{\"titulo\": \"A\u{0007}\", \"sinopsis\": \"B\", \"capitulos\": []}";
        let outline = parse_outline(raw).unwrap();
        assert_eq!(outline.title, "A");
    }

    #[test]
    fn test_malformed_characters_default_to_empty() {
        let raw = r#"{"titulo":"A","sinopsis":"B","capitulos":[],"personajes":"ninguno"}"#;
        assert!(parse_outline(raw).unwrap().characters.is_empty());
    }

    #[test]
    fn test_missing_mandatory_fields_fail() {
        for raw in [
            r#"{"sinopsis":"B","capitulos":[]}"#,
            r#"{"titulo":"A","capitulos":[]}"#,
            r#"{"titulo":"A","sinopsis":"B","capitulos":"uno"}"#,
        ] {
            assert!(matches!(parse_outline(raw), Err(AppError::UpstreamParse(_))), "{raw}");
        }
    }

    #[test]
    fn test_out_of_range_numbers_fall_back_to_position() {
        let raw = r#"{"titulo":"A","sinopsis":"B","capitulos":[
            {"numero":4294967297,"titulo":"C","descripcion":"D"},
            {"numero":"dos","titulo":"E","descripcion":"F"}]}"#;
        let outline = parse_outline(raw).unwrap();
        let numbers: Vec<u32> = outline.chapters.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_unrecoverable_json_never_fabricates_outline() {
        let err = parse_outline("{\"titulo\": \"A\" \"sinopsis\": }").unwrap_err();
        assert!(matches!(err, AppError::UpstreamParse(_)));
    }

    #[test]
    fn test_missing_closers_respects_strings() {
        assert_eq!(missing_closers(r#"{"a":[{"b":"x}]"#), "}]}");
        assert_eq!(missing_closers(r#"{"a":"\"{"}"#), "");
    }

    #[tokio::test]
    async fn test_generate_validates_before_calling_provider() {
        let provider = Arc::new(FakeProvider::new());
        let client = OutlineClient::new(provider.clone(), "modelo");
        let mut config = fixtures::config(3);
        config.topic = String::new();
        assert!(matches!(
            client.generate(&config).await,
            Err(AppError::Configuration(_))
        ));
        assert!(provider.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_generate_accepts_count_mismatch() {
        let provider = Arc::new(FakeProvider::new());
        provider.push_completion(serde_json::to_string(&fixtures::outline(2)).unwrap());
        let client = OutlineClient::new(provider.clone(), "modelo");
        let outline = client.generate(&fixtures::config(3)).await.unwrap();
        assert_eq!(outline.chapters.len(), 2);
        assert_eq!(provider.models(), vec!["modelo".to_string()]);
    }
}
