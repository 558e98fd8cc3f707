use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

/// Get or initialize the cl100k_base tokenizer.
fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer")
    })
}

/// Token count of `text` under cl100k_base.
pub fn estimate_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Token budget of one chunk for a configured `chunk_size`.
///
/// Converted HTML leaves headroom for the prompt template; raw markup is
/// denser and gets a proportionally smaller budget.
pub fn effective_chunk_size(chunk_size: usize, html_converted: bool) -> usize {
    let size = if html_converted {
        chunk_size.saturating_sub(250)
    } else {
        let scaled = (chunk_size as f64 * 0.8) as usize;
        chunk_size.saturating_sub(500).min(scaled)
    };
    size.max(1)
}

/// Split `text` into chunks of at most `max_tokens` tokens each.
///
/// Splits only at whitespace; a single word longer than the budget becomes
/// its own chunk. Chunks are trimmed and empty chunks dropped.
pub fn split_text_into_chunks(text: &str, max_tokens: usize) -> Vec<String> {
    let max_tokens = max_tokens.max(1);
    if estimate_tokens(text) <= max_tokens {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            vec![]
        } else {
            vec![trimmed.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    for piece in text.split_inclusive(char::is_whitespace) {
        let tokens = estimate_tokens(piece);
        if current_tokens + tokens > max_tokens && !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
            current.clear();
            current_tokens = 0;
        }
        current.push_str(piece);
        current_tokens += tokens;
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}
