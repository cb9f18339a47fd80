// ---------------------------------------------------------------------------
// Markdown chunking
// ---------------------------------------------------------------------------

/// One chunk of a markdown document, carrying the heading it fell under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChunk {
    pub text: String,
    pub heading: Option<String>,
}

/// Split markdown by headings of depth 2..=4, then further by size.
///
/// Each chunk carries its nearest heading as metadata. When an accumulated
/// section exceeds `max_chars` it is split, preserving `overlap_chars` of
/// trailing context at every boundary.
pub fn chunk_markdown(content: &str, max_chars: usize, overlap_chars: usize) -> Vec<DocChunk> {
    let max_chars = max_chars.max(1);
    let overlap_chars = overlap_chars.min(max_chars / 2);

    let mut chunks = Vec::new();
    let mut heading: Option<String> = None;
    let mut buffer = String::new();

    let flush = |buffer: &mut String, heading: &Option<String>, chunks: &mut Vec<DocChunk>| {
        let text = buffer.trim();
        if !text.is_empty() {
            chunks.push(DocChunk {
                text: text.to_string(),
                heading: heading.clone(),
            });
        }
        buffer.clear();
    };

    for line in content.lines() {
        if let Some(next_heading) = heading_text(line) {
            flush(&mut buffer, &heading, &mut chunks);
            heading = Some(next_heading);
            continue;
        }

        if buffer.len() + line.len() + 1 > max_chars && !buffer.trim().is_empty() {
            let tail = overlap_tail(&buffer, overlap_chars);
            flush(&mut buffer, &heading, &mut chunks);
            buffer.push_str(&tail);
        }
        buffer.push_str(line);
        buffer.push('\n');
    }
    flush(&mut buffer, &heading, &mut chunks);
    chunks
}

/// Heading text for depth 2..=4 markers, `None` otherwise. Depth-1 titles
/// and deeper subsections stay inside their parent chunk.
fn heading_text(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if !(2..=4).contains(&hashes) {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some(rest.trim().to_string())
}

fn overlap_tail(buffer: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 || buffer.len() <= overlap_chars {
        return String::new();
    }
    let mut start = buffer.len() - overlap_chars;
    while !buffer.is_char_boundary(start) {
        start += 1;
    }
    buffer[start..].to_string()
}

// ---------------------------------------------------------------------------
// Code chunking
// ---------------------------------------------------------------------------

/// One chunk of a code file: a top-level construct, or a line window when
/// the file has no recognizable constructs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChunk {
    pub text: String,
    pub symbol: Option<String>,
    pub start_line: usize,
}

const CODE_KEYWORDS: &[&str] = &[
    "fn", "function", "class", "interface", "type", "struct", "enum", "impl", "trait",
];

const MODIFIERS: &[&str] = &[
    "pub", "export", "default", "async", "static", "abstract", "const", "unsafe", "extern",
];

/// Extract each top-level function, class, interface, and type by brace
/// matching from the discovery site. Files with no such constructs fall back
/// to fixed-size line windows.
pub fn chunk_code(content: &str, window_lines: usize) -> Vec<CodeChunk> {
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        match top_level_symbol(line) {
            Some(symbol) => {
                let end = construct_end(&lines, i);
                let text = lines[i..=end].join("\n");
                chunks.push(CodeChunk {
                    text,
                    symbol: Some(symbol),
                    start_line: i + 1,
                });
                i = end + 1;
            }
            None => i += 1,
        }
    }

    if !chunks.is_empty() {
        return chunks;
    }

    // No constructs found: fixed-size line windows.
    let window_lines = window_lines.max(1);
    lines
        .chunks(window_lines)
        .enumerate()
        .filter_map(|(n, window)| {
            let text = window.join("\n");
            if text.trim().is_empty() {
                None
            } else {
                Some(CodeChunk {
                    text,
                    symbol: None,
                    start_line: n * window_lines + 1,
                })
            }
        })
        .collect()
}

/// The declared symbol name when `line` opens a top-level construct.
/// Top-level means no leading indentation.
fn top_level_symbol(line: &str) -> Option<String> {
    if line.starts_with(char::is_whitespace) || line.is_empty() {
        return None;
    }
    let mut tokens = line
        .split(|c: char| c.is_whitespace() || c == '(' || c == '<' || c == '{' || c == ':')
        .filter(|t| !t.is_empty());

    let mut keyword = tokens.next()?;
    while MODIFIERS.contains(&keyword) {
        keyword = tokens.next()?;
    }
    if !CODE_KEYWORDS.contains(&keyword) {
        return None;
    }
    tokens.next().map(|name| name.trim_end_matches(';').to_string())
}

/// Index of the construct's last line, by brace matching from the discovery
/// site. Braceless declarations (`type X = Y;`) end at the first `;`.
fn construct_end(lines: &[&str], start: usize) -> usize {
    let mut depth: i32 = 0;
    let mut seen_brace = false;
    for (offset, line) in lines[start..].iter().enumerate() {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    seen_brace = true;
                }
                '}' => depth -= 1,
                ';' if !seen_brace => return start + offset,
                _ => {}
            }
        }
        if seen_brace && depth <= 0 {
            return start + offset;
        }
    }
    lines.len() - 1
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
