//! Conversion of agent markdown into Telegram MarkdownV2.
//!
//! Recognized agent markup is translated into the MarkdownV2 equivalent.
//! Everything else has its reserved characters backslash-escaped so Telegram
//! accepts the message.
//!
//! | agent                       | MarkdownV2        |
//! |-----------------------------|-------------------|
//! | `**strong**`, `__strong__`  | `*strong*`        |
//! | `*em*`, `_em_`              | `_em_`            |
//! | `~~strike~~`                | `~strike~`        |
//! | `# heading`                 | `*heading*`       |
//! | `> quote`, `**> expandable` | `> quote`         |
//! | `` `code` ``, fences        | kept, raw content |
//! | `[label](url)`              | kept              |

/// Characters MarkdownV2 reserves outside of code.
const RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

const FENCE: &str = "```";

/// Spans close within this many characters of their opener or stay text.
const MAX_SPAN_CHARS: usize = 1024;

const MAX_LANGUAGE_CHARS: usize = 32;

/// Convert agent markdown to MarkdownV2.
pub fn escape(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut in_fence = false;
    let mut after_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();

        if let Some(info) = trimmed.strip_prefix(FENCE) {
            if in_fence {
                lines.push(FENCE.to_string());
                in_fence = false;
                after_fence = true;
            } else {
                while lines.last().is_some_and(|last| last.is_empty()) {
                    lines.pop();
                }
                if !lines.is_empty() {
                    lines.push(String::new());
                }
                let language: String = info
                    .trim()
                    .chars()
                    .filter(|c| c.is_alphanumeric() || matches!(c, '+' | '-' | '_' | '#'))
                    .take(MAX_LANGUAGE_CHARS)
                    .collect();
                lines.push(format!("{FENCE}{language}"));
                in_fence = true;
                after_fence = false;
            }
            continue;
        }

        if in_fence {
            lines.push(escape_code(line));
            continue;
        }

        if after_fence {
            if line.trim().is_empty() {
                continue;
            }
            lines.push(String::new());
            after_fence = false;
        }

        lines.push(escape_line(line));
    }

    if in_fence {
        lines.push(FENCE.to_string());
    }

    lines.join("\n")
}

fn escape_line(line: &str) -> String {
    let trimmed = line.trim_start();

    if let Some(content) = quote_content(trimmed) {
        let content = escape_inline(content.trim());
        return if content.is_empty() {
            ">".to_string()
        } else {
            format!("> {content}")
        };
    }

    if let Some(heading) = heading_content(trimmed) {
        return format!("*{}*", escape_inline(heading));
    }

    escape_inline(line)
}

/// Content of a quote line with every quote marker removed: `>`, nested
/// `>>`, the expandable opener `**>` and the expandable closer `||`.
fn quote_content(line: &str) -> Option<&str> {
    let rest = line
        .strip_prefix("**>")
        .or_else(|| line.strip_prefix('>'))?;
    let rest = rest.trim_start_matches(|c: char| c == '>' || c.is_whitespace());
    Some(rest.trim_end().strip_suffix("||").unwrap_or(rest))
}

fn heading_content(line: &str) -> Option<&str> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let heading = rest.trim();
    (!heading.is_empty()).then_some(heading)
}

fn escape_inline(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut index = 0;

    while index < chars.len() {
        if let Some((rendered, next)) = match_span(&chars, index) {
            out.push_str(&rendered);
            index = next;
            continue;
        }
        push_escaped(&mut out, chars[index]);
        index += 1;
    }

    out
}

/// Try to read a markup span starting at `start`. Returns the rendered span
/// and the index just past it.
fn match_span(chars: &[char], start: usize) -> Option<(String, usize)> {
    let chars = &chars[..chars.len().min(start + MAX_SPAN_CHARS)];
    let current = chars[start];
    let next = chars.get(start + 1).copied();

    match (current, next) {
        ('`', _) => {
            let end = find_char(chars, start + 1, '`')?;
            let code: String = chars[start + 1..end].iter().collect();
            Some((format!("`{}`", escape_code(&code)), end + 1))
        }
        ('*', Some('*')) | ('_', Some('_')) => {
            if current == '_' && !opens_underscore(chars, start) {
                return None;
            }
            let end = find_pair(chars, start + 2, current)?;
            let inner = opening_inner(chars, start + 2, end)?;
            Some((format!("*{}*", escape_inline(&inner)), end + 2))
        }
        ('~', Some('~')) => {
            let end = find_pair(chars, start + 2, '~')?;
            let inner = opening_inner(chars, start + 2, end)?;
            Some((format!("~{}~", escape_inline(&inner)), end + 2))
        }
        ('*', _) | ('_', _) => {
            if current == '_' && !opens_underscore(chars, start) {
                return None;
            }
            let end = find_single_closer(chars, start + 1, current)?;
            let inner = opening_inner(chars, start + 1, end)?;
            Some((format!("_{}_", escape_inline(&inner)), end + 1))
        }
        ('[', _) => {
            let label_end = find_char(chars, start + 1, ']')?;
            if chars.get(label_end + 1) != Some(&'(') {
                return None;
            }
            let url_end = find_url_end(chars, label_end + 2)?;
            let label: String = chars[start + 1..label_end].iter().collect();
            let url: String = chars[label_end + 2..url_end].iter().collect();
            if label.trim().is_empty() || url.trim().is_empty() {
                return None;
            }
            Some((
                format!("[{}]({})", escape_inline(&label), escape_url(&url)),
                url_end + 1,
            ))
        }
        _ => None,
    }
}

/// Inner text of an emphasis span, rejected when empty or padded with
/// whitespace right inside the markers (`* not emphasis *`).
fn opening_inner(chars: &[char], from: usize, to: usize) -> Option<String> {
    if from >= to {
        return None;
    }
    let inner = &chars[from..to];
    let first = inner.first()?;
    let last = inner.last()?;
    if first.is_whitespace() || last.is_whitespace() {
        return None;
    }
    Some(inner.iter().collect())
}

/// `_` only opens emphasis at a word boundary, so `snake_case` stays text.
fn opens_underscore(chars: &[char], start: usize) -> bool {
    start == 0 || !chars[start - 1].is_alphanumeric()
}

fn find_char(chars: &[char], from: usize, target: char) -> Option<usize> {
    chars
        .get(from..)?
        .iter()
        .position(|c| *c == target)
        .map(|offset| from + offset)
}

/// Index of the next doubled `marker` at or after `from`.
fn find_pair(chars: &[char], from: usize, marker: char) -> Option<usize> {
    (from..chars.len().saturating_sub(1)).find(|&i| chars[i] == marker && chars[i + 1] == marker)
}

/// Index of the next single `marker` closing an emphasis span. Doubled
/// markers are skipped, and `_` must end at a word boundary.
fn find_single_closer(chars: &[char], from: usize, marker: char) -> Option<usize> {
    let mut index = from;
    while index < chars.len() {
        if chars[index] == marker {
            if chars.get(index + 1) == Some(&marker) {
                index += 2;
                continue;
            }
            let boundary = marker != '_'
                || chars.get(index + 1).is_none_or(|next| !next.is_alphanumeric());
            if boundary {
                return Some(index);
            }
        }
        index += 1;
    }
    None
}

/// Closing `)` of a link target, allowing balanced parentheses in the URL.
fn find_url_end(chars: &[char], from: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, c) in chars.get(from..)?.iter().enumerate() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(from + offset),
            ')' => depth -= 1,
            ' ' => return None,
            _ => {}
        }
    }
    None
}

fn push_escaped(out: &mut String, c: char) {
    if RESERVED.contains(&c) {
        out.push('\\');
    }
    out.push(c);
}

/// Inside code only the backtick and the backslash need escaping.
fn escape_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inside a link target only `)` and the backslash need escaping.
fn escape_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for c in url.chars() {
        if c == ')' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_reserved_characters_in_plain_text() {
        assert_eq!(escape("Hello world."), "Hello world\\.");
        assert_eq!(escape("1 + 1 = 2!"), "1 \\+ 1 \\= 2\\!");
        assert_eq!(escape("{a|b} #1 (x)"), "\\{a\\|b\\} \\#1 \\(x\\)");
        assert_eq!(escape("- item"), "\\- item");
        assert_eq!(escape("C:\\path"), "C:\\\\path");
    }

    #[test]
    fn swaps_emphasis_and_strong() {
        assert_eq!(escape("**bold** and *italic*"), "*bold* and _italic_");
        assert_eq!(escape("__bold__ and _italic_"), "*bold* and _italic_");
        assert_eq!(escape("**bold with *nested* em**"), "*bold with _nested_ em*");
    }

    #[test]
    fn stray_markers_are_escaped() {
        assert_eq!(escape("2 * 3 * 4"), "2 \\* 3 \\* 4");
        assert_eq!(escape("snake_case_name"), "snake\\_case\\_name");
        assert_eq!(escape("a ** b"), "a \\*\\* b");
        assert_eq!(escape("unclosed *emphasis"), "unclosed \\*emphasis");
    }

    #[test]
    fn strikethrough_is_single_tilde() {
        assert_eq!(escape("~~gone~~ now"), "~gone~ now");
    }

    #[test]
    fn inline_code_content_is_not_escaped() {
        assert_eq!(escape("run `a.b(c)` now."), "run `a.b(c)` now\\.");
        assert_eq!(escape("`C:\\x`"), "`C:\\\\x`");
    }

    #[test]
    fn links_keep_their_shape() {
        assert_eq!(
            escape("see [the docs](https://example.com/a_b) now"),
            "see [the docs](https://example.com/a_b) now"
        );
        assert_eq!(
            escape("[wiki](https://en.wikipedia.org/wiki/Rust_(language))"),
            "[wiki](https://en.wikipedia.org/wiki/Rust_(language\\))"
        );
        assert_eq!(escape("[not a link]"), "\\[not a link\\]");
    }

    #[test]
    fn headings_become_bold() {
        assert_eq!(escape("# Summary"), "*Summary*");
        assert_eq!(escape("### Step 1."), "*Step 1\\.*");
        assert_eq!(escape("#hashtag"), "\\#hashtag");
    }

    #[test]
    fn quotes_collapse_to_single_prefix() {
        assert_eq!(escape("> quoted text."), "> quoted text\\.");
        assert_eq!(escape(">> nested"), "> nested");
        assert_eq!(
            escape("**>hidden start\n>middle\n>end||"),
            "> hidden start\n> middle\n> end"
        );
        assert_eq!(escape(">"), ">");
    }

    #[test]
    fn fenced_code_is_raw_with_single_blank_lines_around() {
        let input = "Intro:\n\n\n```rust\nlet x = a.b()?;\n```\n\n\nAfter.";
        let expected = "Intro:\n\n```rust\nlet x = a.b()?;\n```\n\nAfter\\.";
        assert_eq!(escape(input), expected);

        let input = "Before\n```\nraw_text * here\n```\nAfter";
        let expected = "Before\n\n```\nraw_text * here\n```\n\nAfter";
        assert_eq!(escape(input), expected);
    }

    #[test]
    fn fence_at_boundaries_gets_no_extra_blank_lines() {
        assert_eq!(escape("```\ncode\n```"), "```\ncode\n```");
    }

    #[test]
    fn unclosed_fence_is_closed() {
        assert_eq!(escape("```sh\necho hi"), "```sh\necho hi\n```");
    }

    #[test]
    fn code_escapes_backticks_and_backslashes_only() {
        assert_eq!(escape("```\na\\b `c`\n```"), "```\na\\\\b \\`c\\`\n```");
    }

    #[test]
    fn spans_close_within_the_search_window() {
        let short = "a".repeat(10);
        assert_eq!(escape(&format!("*{short}*")), format!("_{short}_"));

        let long = "a".repeat(MAX_SPAN_CHARS + 10);
        assert_eq!(escape(&format!("*{long}*")), format!("\\*{long}\\*"));
    }

    #[test]
    fn long_line_of_unclosed_markers_is_escaped() {
        let line = "*a ".repeat(20_000);
        let escaped = escape(&line);
        assert_eq!(escaped.matches("\\*").count(), 20_000);
        assert!(!escaped.contains('_'));
    }

    #[test]
    fn fence_language_is_capped() {
        let input = format!("```{}\ncode\n```", "x".repeat(100));
        let expected = format!("```{}\ncode\n```", "x".repeat(MAX_LANGUAGE_CHARS));
        assert_eq!(escape(&input), expected);
    }
}
