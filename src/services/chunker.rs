/// Characters a chunk may end on before falling back to a newline.
const SENTENCE_TERMINATORS: [char; 6] = ['。', '！', '？', '.', '!', '?'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    /// Byte offset of the untrimmed chunk in the source text.
    pub offset: usize,
    pub text: String,
}

impl TextChunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Leading characters of the chunk, for log lines.
    pub fn preview(&self, max_chars: usize) -> String {
        self.text.chars().take(max_chars).collect()
    }
}

/// Cleans up a manuscript before chunking: normalises line endings, trims
/// every line, squeezes horizontal whitespace and drops blank lines.
pub fn normalize_text(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits `text` into contiguous chunks of at most `max_chars` characters,
/// preferring to break after sentence punctuation, then after a newline.
pub fn split_text(text: &str, max_chars: usize) -> Vec<TextChunk> {
    let max_chars = max_chars.max(1);
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let total = chars.len();
    let byte_at = |i: usize| if i < total { chars[i].0 } else { text.len() };

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < total {
        let limit = start + max_chars;
        let end = if limit < total {
            find_break(&chars[start..limit])
                .map(|pos| start + pos + 1)
                .filter(|&end| end > start)
                .unwrap_or(limit)
        } else {
            total
        };

        let piece = text[byte_at(start)..byte_at(end)].trim();
        if !piece.is_empty() {
            chunks.push(TextChunk {
                index: chunks.len(),
                offset: byte_at(start),
                text: piece.to_string(),
            });
        }
        start = end;
    }

    chunks
}

fn find_break(window: &[(usize, char)]) -> Option<usize> {
    window
        .iter()
        .rposition(|(_, c)| SENTENCE_TERMINATORS.contains(c))
        .or_else(|| window.iter().rposition(|(_, c)| *c == '\n'))
}
