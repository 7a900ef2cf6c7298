//! Prompt construction for rewrites, headlines and summaries.
//!
//! Prompts are in Spanish because every configured source publishes in
//! Spanish and the output is read by an Argentine audience.

use crate::models::{LengthChange, RewriteOptions, Style, Tone};

const BASE_ROLE: &str = "Eres un editor senior de noticias argentinas con 20 años de experiencia.";

fn style_block(style: Style) -> &'static str {
    match style {
        Style::Formal => {
            "ESTILO PERIODÍSTICO FORMAL:
- Lenguaje claro, directo y profesional
- Vocabulario neutro y preciso
- Estructura de pirámide invertida: lo más importante primero
- Tono formal pero accesible al público general"
        }
        Style::Casual => {
            "ESTILO CERCANO:
- Lenguaje coloquial rioplatense, sin vulgaridades
- Oraciones cortas y ritmo ágil
- Explica la relevancia para el lector común
- Evita la jerga técnica o explícala en pocas palabras"
        }
        Style::Investigative => {
            "ESTILO DE INVESTIGACIÓN:
- Ordena los hechos en una cronología clara
- Distingue lo confirmado de lo que afirma cada fuente
- Destaca cifras, documentos y actores involucrados
- Señala las preguntas que la información deja abiertas"
        }
        Style::Opinion => {
            "ESTILO DE COLUMNA DE OPINIÓN:
- Presenta primero los hechos y luego su análisis
- Argumenta con claridad y en primera persona del plural
- Separa explícitamente la interpretación de la información
- Cierra con una conclusión breve"
        }
    }
}

fn tone_block(tone: Tone) -> &'static str {
    match tone {
        Tone::Neutral => "TONO: neutral y objetivo, sin adjetivos valorativos.",
        Tone::Critical => {
            "TONO: crítico. Señala contradicciones, costos y riesgos, sin caer en la descalificación."
        }
        Tone::Supportive => {
            "TONO: favorable. Destaca los aspectos positivos y las oportunidades, sin ocultar datos adversos."
        }
    }
}

/// Length instruction relative to the source text.
pub fn length_instruction(length: LengthChange) -> &'static str {
    match length {
        LengthChange::Shorter => {
            "EXTENSIÓN: aproximadamente un 30% más breve que el original, conservando lo esencial."
        }
        LengthChange::Same => "EXTENSIÓN: similar a la del original.",
        LengthChange::Longer => {
            "EXTENSIÓN: aproximadamente un 30% más extensa que el original, ampliando el contexto presente en el texto."
        }
    }
}

const PRESERVE_FACTS: &str = "RESTRICCIÓN OBLIGATORIA: conserva exactamente todos los nombres propios, fechas, citas textuales, cifras y estadísticas. No agregues información que no esté en el original ni cambies el sentido de los hechos.";

/// System prompt for the rewrite call, selected by style and adjusted by tone.
pub fn rewrite_system_prompt(options: &RewriteOptions) -> String {
    format!(
        "{BASE_ROLE}\n\n{}\n\n{}",
        style_block(options.style),
        tone_block(options.tone)
    )
}

pub fn rewrite_user_prompt(title: &str, body: &str, options: &RewriteOptions) -> String {
    let mut prompt = String::from(
        "TAREA: reescribe completamente la siguiente noticia con tu propia narrativa. No copies frases textuales.\n\n",
    );
    prompt.push_str(length_instruction(options.length));
    prompt.push('\n');
    if options.preserve_facts {
        prompt.push_str(PRESERVE_FACTS);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nFORMATO: devuelve solamente el cuerpo de la nota en HTML, un elemento <p> por párrafo, sin título, sin markdown y sin texto adicional.\n",
    );
    prompt.push_str("\nNOTICIA ORIGINAL:\n━━━━━━━━━━━━━━━━━━━━\n");
    prompt.push_str(&format!("Título: {title}\n\n{body}\n"));
    prompt.push_str("━━━━━━━━━━━━━━━━━━━━\n");
    prompt
}

pub fn headline_system_prompt(options: &RewriteOptions) -> String {
    format!(
        "{BASE_ROLE} Escribes títulos periodísticos precisos y atractivos.\n\n{}",
        tone_block(options.tone)
    )
}

pub fn headline_user_prompt(content: &str) -> String {
    format!(
        "Escribe un título (80 a 100 caracteres) y un subtítulo opcional (hasta 150 caracteres) para esta nota.
Responde ÚNICAMENTE con un objeto JSON de la forma {{\"title\": \"...\", \"subtitle\": \"...\"}}.

NOTA:
{content}"
    )
}

pub fn summary_system_prompt() -> String {
    format!("{BASE_ROLE} Redactas bajadas periodísticas breves y fieles a la nota.")
}

pub fn summary_user_prompt(content: &str, target_len: usize) -> String {
    format!(
        "Resume la siguiente nota en un único párrafo de no más de {target_len} caracteres, con lo esencial de la noticia. Responde solo con el texto del resumen, sin comillas ni HTML.

NOTA:
{content}"
    )
}
