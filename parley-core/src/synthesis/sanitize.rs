//! Text clean-up applied to each phrase right before rendering.

/// Fold typographic punctuation to ASCII and drop what a synthesizer cannot
/// voice (emoji, pictographs, markdown emphasis). Whitespace is collapsed.
pub fn sanitize_for_speech(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '—' | '–' => folded.push_str(", "),
            '…' => folded.push_str("..."),
            '‘' | '’' | '‚' | '′' => folded.push('\''),
            '“' | '”' | '„' | '″' => folded.push('"'),
            '*' | '#' | '_' | '`' | '~' | '|' | '<' | '>' => folded.push(' '),
            c if c.is_whitespace() => folded.push(' '),
            c if c.is_alphanumeric() || c.is_ascii_punctuation() => folded.push(c),
            _ => {}
        }
    }

    let mut out = String::with_capacity(folded.len());
    for word in folded.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    // ", " from a dash can land before closing punctuation.
    out.replace(" ,", ",").replace(",,", ",")
}

/// Whether the sanitised text has anything a synthesizer would voice.
pub fn is_speakable(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}
