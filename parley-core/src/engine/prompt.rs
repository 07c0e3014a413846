//! ChatML prompt framing and exit-phrase matching.

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";

/// Appended to the model context when a reply ended without the model's
/// own end-of-turn token.
pub const CONTEXT_CLOSE: &str = "<|im_end|>\n";

/// Frame one user turn. `preamble` is only passed on the first turn.
pub fn build_prompt(preamble: Option<&str>, user_text: &str) -> String {
    let mut prompt = String::with_capacity(user_text.len() + 64);
    if let Some(system) = preamble.filter(|p| !p.trim().is_empty()) {
        prompt.push_str(IM_START);
        prompt.push_str("system\n");
        prompt.push_str(system.trim());
        prompt.push_str(IM_END);
        prompt.push('\n');
    }
    prompt.push_str(IM_START);
    prompt.push_str("user\n");
    prompt.push_str(user_text.trim());
    prompt.push_str(IM_END);
    prompt.push('\n');
    prompt.push_str(IM_START);
    prompt.push_str("assistant\n");
    prompt
}

/// Case-insensitive substring match against the configured phrases.
pub fn is_exit_phrase(text: &str, phrases: &[String]) -> bool {
    let lowered = text.to_lowercase();
    phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| lowered.contains(&p))
}
