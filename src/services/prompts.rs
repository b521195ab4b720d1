//! Instruction text sent to the model at each stage. Pure functions only.

use std::fmt::Write;

use crate::error::{AppError, Result};
use crate::models::{BookConfiguration, Outline};

/// Where a chapter sits in the book, by percentage of the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrativePhase {
    Opening,
    Rising,
    Climax,
    Resolution,
}

impl NarrativePhase {
    pub fn for_chapter(number: u32, total: u32) -> Self {
        let total = total.max(1);
        let percent = number as f64 * 100.0 / total as f64;
        if percent <= 25.0 {
            NarrativePhase::Opening
        } else if percent <= 50.0 {
            NarrativePhase::Rising
        } else if percent <= 75.0 {
            NarrativePhase::Climax
        } else {
            NarrativePhase::Resolution
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            NarrativePhase::Opening => {
                "Apertura: presenta el mundo, los personajes y el conflicto central sin resolver nada todavía."
            }
            NarrativePhase::Rising => {
                "Desarrollo: complica el conflicto, eleva la tensión y profundiza las relaciones entre personajes."
            }
            NarrativePhase::Climax => {
                "Clímax: lleva el conflicto a su punto de máxima tensión y fuerza decisiones difíciles."
            }
            NarrativePhase::Resolution => {
                "Desenlace: resuelve los hilos abiertos y cierra los arcos de los personajes de forma coherente."
            }
        }
    }
}

pub fn outline_prompt(config: &BookConfiguration) -> String {
    let count = config.chapter_count;
    format!(
        r#"Eres un profesional creador de esquemas de libros y guionista experto. Vas a crear un esquema detallado para un libro a partir de la descripción del usuario.

DESCRIPCIÓN/HISTORIA DEL USUARIO:
"{topic}"

ESPECIFICACIONES TÉCNICAS:
- Género: {genre}
- Estilo de escritura: {style}
- Tono: {tone}
- Audiencia objetivo: {audience}
- Número de capítulos: {count}

INSTRUCCIONES:
1. Analiza la descripción y extrae personajes, trama, conflictos y elementos clave
2. Usa exactamente los nombres, lugares y detalles que mencione el usuario
3. Completa la información que falte de forma coherente con lo descrito

El esquema debe incluir:
1. Título: creativo y fiel a la esencia de la historia
2. Sinopsis: 200-250 palabras
3. Capítulos: exactamente {count}, cada uno con título y una descripción de 2-4 oraciones, con progresión lógica del inicio al desenlace
4. Personajes principales: nombre y descripción (personalidad, motivaciones, rol)
5. Arco narrativo: estructura general del libro (150-200 palabras)

IMPORTANTE: Responde ÚNICAMENTE con JSON válido en este formato exacto:
{{
  "titulo": "string",
  "sinopsis": "string",
  "capitulos": [
    {{ "numero": 1, "titulo": "string", "descripcion": "string" }}
  ],
  "personajes": [
    {{ "nombre": "string", "descripcion": "string" }}
  ],
  "arcoNarrativo": "string"
}}

No incluyas texto fuera del JSON. El array de capítulos debe tener exactamente {count} elementos. Si el género no requiere personajes, deja el array de personajes vacío."#,
        topic = config.topic.trim(),
        genre = config.genre,
        style = config.style,
        tone = config.tone,
        audience = config.audience,
    )
}

/// Prompt for one chapter. Fails when the outline has no stub for `number`.
pub fn chapter_prompt(
    number: u32,
    outline: &Outline,
    config: &BookConfiguration,
    prior_summaries: &[String],
) -> Result<String> {
    let stub = outline.stub(number).ok_or_else(|| {
        AppError::InvalidState(format!(
            "No se encontró información para el capítulo {number}"
        ))
    })?;
    let total = outline.chapters.len() as u32;
    let phase = NarrativePhase::for_chapter(number, total);

    let mut prompt = format!(
        "Eres un escritor profesional escribiendo el Capítulo {number} de {total} de un libro.

CONTEXTO DEL LIBRO:
- Título: {title}
- Género: {genre}
- Estilo de escritura: {style}
- Tono: {tone}
- Audiencia objetivo: {audience}
- Sinopsis: {synopsis}

ARCO NARRATIVO GENERAL:
{arc}
",
        title = outline.title,
        genre = config.genre,
        style = config.style,
        tone = config.tone,
        audience = config.audience,
        synopsis = outline.synopsis,
        arc = outline.narrative_arc,
    );

    if !outline.characters.is_empty() {
        prompt.push_str("\nPERSONAJES PRINCIPALES:\n");
        for character in &outline.characters {
            let _ = writeln!(prompt, "- {}: {}", character.name, character.description);
        }
    }

    if !prior_summaries.is_empty() {
        prompt.push_str("\nRESUMEN DE CAPÍTULOS ANTERIORES:\n");
        for (index, summary) in prior_summaries.iter().enumerate() {
            let _ = write!(prompt, "\nCapítulo {}:\n{}\n", index + 1, summary);
        }
    }

    let _ = write!(
        prompt,
        "
POSICIÓN EN LA HISTORIA:
{guidance}

OBJETIVO DEL CAPÍTULO {number}:
Título: \"{chapter_title}\"
Descripción: {description}

INSTRUCCIONES:
- Apertura que enganche al lector
- Contenido bien desarrollado (2000-3500 palabras aproximadamente)
- Continuidad natural con los capítulos anteriores
- Diálogos naturales y descripciones inmersivas
- Final que invite a seguir leyendo
- Consistencia de estilo, tono y voz narrativa

NO incluyas el título del capítulo en tu respuesta, solo el contenido narrativo.

Comienza a escribir el capítulo ahora:",
        guidance = phase.guidance(),
        chapter_title = stub.title,
        description = stub.description,
    );

    Ok(prompt)
}

pub fn revision_prompt(content: &str, instructions: &str) -> String {
    format!(
        "Eres un editor profesional de libros. Revisa y mejora el siguiente capítulo según las instrucciones.

CAPÍTULO ORIGINAL:
{content}

INSTRUCCIONES DE REVISIÓN:
{instructions}

Mantén la coherencia narrativa, el tono y el estilo del original mientras aplicas los cambios solicitados.

Proporciona ÚNICAMENTE el capítulo revisado, sin explicaciones ni comentarios. Comienza directamente con el contenido revisado:"
    )
}

pub fn topic_improvement_prompt(topic: &str) -> String {
    format!(
        "Eres un asistente experto en desarrollo de historias. Toma la descripción inicial de un libro y mejórala, haciéndola más detallada, coherente y atractiva.

DESCRIPCIÓN ORIGINAL DEL USUARIO:
{topic}

Pautas:
1. Mantén la idea central
2. Añade detalles de personajes, ambientación, conflictos y motivaciones
3. Define un conflicto central claro y lo que está en juego
4. Sugiere tono, atmósfera y temas a explorar
5. Extiende la descripción a 3-5 párrafos

Proporciona ÚNICAMENTE la descripción mejorada, sin introducciones ni comentarios.

Descripción mejorada:"
    )
}
