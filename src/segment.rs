use log::debug;

/// Absolute floor for a chunk; below this the per-segment prompts dominate
/// the payload and summaries stop being useful.
const MIN_SEGMENT_CHARS: usize = 1_000;

/// A bounded-size slice of the transcript, cut on the best available boundary
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: usize,
    pub text: String,
    pub approx_tokens: usize,
}

/// Fixed chars-per-token heuristic used everywhere sizing matters
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Split `text` into segments of at most `target_max_chars`, preferring
/// sentence ends, then clauses, then newlines, then a hard cut. The target
/// is tightened when the whole text would not fit `context_tokens` anyway,
/// so no single segment can exceed the model's real window.
pub fn split_text(text: &str, target_max_chars: usize, context_tokens: usize) -> Vec<Segment> {
    let trimmed = text.trim();

    let mut target = target_max_chars.max(1);
    let estimated = estimate_tokens(trimmed);
    if estimated > context_tokens && context_tokens > 0 {
        let tightened = (trimmed.len() * 3 * context_tokens) / (estimated * 4);
        if tightened < target {
            target = tightened.max(MIN_SEGMENT_CHARS);
            debug!(
                "📏 Tightened segment target to {} chars ({} estimated tokens vs {} context)",
                target, estimated, context_tokens
            );
        }
    }

    if trimmed.len() <= target {
        return vec![Segment {
            index: 0,
            text: trimmed.to_string(),
            approx_tokens: estimate_tokens(trimmed),
        }];
    }

    let mut segments = Vec::new();
    let mut remaining = trimmed;

    while remaining.len() > target {
        let window_end = floor_char_boundary(remaining, target);
        let window = &remaining[..window_end];

        // Boundary preference ladder: sentence, clause, line, hard cut
        let cut = window
            .rfind(". ")
            .map(|i| i + 1)
            .or_else(|| window.rfind(", ").map(|i| i + 1))
            .or_else(|| window.rfind('\n'))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);

        let (head, tail) = remaining.split_at(cut);
        let piece = head.trim();
        if !piece.is_empty() {
            segments.push(Segment {
                index: segments.len(),
                text: piece.to_string(),
                approx_tokens: estimate_tokens(piece),
            });
        }
        remaining = tail.trim_start();
    }

    let piece = remaining.trim();
    if !piece.is_empty() || segments.is_empty() {
        segments.push(Segment {
            index: segments.len(),
            text: piece.to_string(),
            approx_tokens: estimate_tokens(piece),
        });
    }

    segments
}
