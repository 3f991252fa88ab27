use std::fs;

use log::debug;

/// The four instruction prompts the pipeline uses. Each can be overridden by
/// a text file next to the binary; built-in French defaults otherwise.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub segment: String,
    pub segment_simple: String,
    pub fusion: String,
    pub final_fusion: String,
    pub question: String,
}

const SEGMENT_FALLBACK: &str = "Fais un résumé du contenu en apportant un maximum de valeur \
au lecteur. Utilise des points clairs, sans répétition, et mets en avant les idées clés.";

const SEGMENT_SIMPLE_FALLBACK: &str =
    "Résume ce texte en quelques phrases simples, sans commentaire.";

const FUSION_FALLBACK: &str = "Voici plusieurs résumés partiels consécutifs d'une même vidéo. \
Fusionne-les en un seul résumé cohérent, sans répétition, en conservant l'ordre des idées.";

const FINAL_FUSION_FALLBACK: &str = "Voici plusieurs résumés partiels d'une vidéo. \
Fusionne-les en un résumé clair, structuré et synthétique en 5 points, \
en mettant en avant les idées clés et les informations qui apportent le plus de valeur au lecteur.";

const QUESTION_FALLBACK: &str =
    "Tu es un assistant qui répond précisément à des questions sur une vidéo.";

/// Load one prompt file using the usual multi-path fallback, or the built-in text
fn load_prompt(basename: &str, fallback: &str) -> String {
    let candidates = [
        format!("{}.txt", basename),
        format!("../{}.txt", basename),
        format!("../../{}.txt", basename),
        format!("src/{}.txt", basename),
        format!("example_{}.txt", basename),
    ];

    for path in &candidates {
        if let Ok(content) = fs::read_to_string(path) {
            // Remove BOM if present
            let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
            debug!("📄 Prompt '{}' loaded from {}", basename, path);
            return content.trim().to_string();
        }
    }

    debug!("📄 Prompt '{}' using built-in fallback", basename);
    fallback.to_string()
}

impl PromptSet {
    pub fn load() -> Self {
        Self {
            segment: load_prompt("segment_prompt", SEGMENT_FALLBACK),
            segment_simple: load_prompt("segment_simple_prompt", SEGMENT_SIMPLE_FALLBACK),
            fusion: load_prompt("fusion_prompt", FUSION_FALLBACK),
            final_fusion: load_prompt("final_fusion_prompt", FINAL_FUSION_FALLBACK),
            question: load_prompt("question_prompt", QUESTION_FALLBACK),
        }
    }
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            segment: SEGMENT_FALLBACK.to_string(),
            segment_simple: SEGMENT_SIMPLE_FALLBACK.to_string(),
            fusion: FUSION_FALLBACK.to_string(),
            final_fusion: FINAL_FUSION_FALLBACK.to_string(),
            question: QUESTION_FALLBACK.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_falls_back_to_builtin_text() {
        let prompt = load_prompt("definitely_missing_prompt_file", SEGMENT_FALLBACK);
        assert_eq!(prompt, SEGMENT_FALLBACK);
    }

    #[test]
    fn test_default_set_is_nonempty() {
        let set = PromptSet::default();
        assert!(!set.segment.is_empty());
        assert!(!set.segment_simple.is_empty());
        assert!(!set.fusion.is_empty());
        assert!(set.final_fusion.contains("5 points"));
        assert!(set.question.contains("questions"));
    }
}
