//! Turns captured job output into reply chunks.
//!
//! The pipeline is: strip the queue's framing lines, escape for the
//! channel's markup, split into messages that fit the channel limit.

pub mod markdown;

/// Remove the queue's framing from captured output.
///
/// The queue writes one command-echo line before the program output and one
/// status line after it. With more than two lines both are dropped; one- or
/// two-line output is kept as is. This assumes every job file is framed by
/// exactly one line on each side.
pub fn strip_frame(raw: &str) -> String {
    let lines: Vec<&str> = raw.trim_end().lines().collect();
    let body = if lines.len() > 2 {
        &lines[1..lines.len() - 1]
    } else {
        &lines[..]
    };
    body.join("\n").trim().to_string()
}

/// Opening and closing marker of a fenced code block.
const FENCE: &str = "```";

/// Characters needed to close a code block at the end of a chunk: `\n` and
/// the fence.
const FENCE_CLOSE_CHARS: usize = 4;

/// Split escaped `text` into chunks of at most `limit` characters.
///
/// Cuts fall on line boundaries (the newline itself is dropped). A line
/// longer than a whole chunk is cut at the last point outside any markup
/// span, never between an escape backslash and the character it escapes.
/// A code block cut across chunks is closed at the end of one and reopened,
/// with its language, at the start of the next. Chunks are trimmed and empty
/// chunks are dropped.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut splitter = Splitter::new(limit.max(2));
    for line in text.lines() {
        splitter.push_line(line);
    }
    splitter.finish()
}

struct Splitter {
    limit: usize,
    chunks: Vec<String>,
    current: String,
    current_chars: usize,
    /// `current` holds nothing but a reopened fence line.
    header_only: bool,
    /// Opening fence line of the code block being split.
    fence: Option<String>,
    /// Byte and char offsets of an opening fence in `current` that has no
    /// code line after it yet.
    pending_opener: Option<(usize, usize)>,
}

impl Splitter {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            chunks: Vec::new(),
            current: String::new(),
            current_chars: 0,
            header_only: false,
            fence: None,
            pending_opener: None,
        }
    }

    fn push_line(&mut self, line: &str) {
        let is_fence = line.starts_with(FENCE);
        let opens = is_fence && self.fence.is_none();
        let closes = is_fence && self.fence.is_some();
        let reserve = if closes || (self.fence.is_none() && !opens) {
            0
        } else {
            FENCE_CLOSE_CHARS
        };
        let chars = line.chars().count();

        if !self.fits(chars + reserve) {
            self.flush();
        }

        if opens {
            self.pending_opener = Some((self.current.len(), self.current_chars));
            self.append(line, chars);
            self.fence = Some(line.to_string());
            return;
        }

        if self.fits(chars + reserve) {
            self.append(line, chars);
        } else {
            self.hard_cut(line, reserve);
        }
        self.pending_opener = None;
        if closes {
            self.fence = None;
        }
    }

    /// Spread one overlong line over as many chunks as it needs.
    fn hard_cut(&mut self, line: &str, reserve: usize) {
        let in_code = self.fence.is_some();
        let mut rest = line;

        loop {
            let separator = usize::from(!self.current.is_empty());
            let room = self
                .limit
                .saturating_sub(self.current_chars + separator + reserve)
                .max(1);
            let rest_chars = rest.chars().count();
            if rest_chars <= room {
                self.append(rest, rest_chars);
                return;
            }

            let cut = cut_point(rest, room, in_code);
            self.append(&rest[..cut], rest[..cut].chars().count());
            self.pending_opener = None;
            self.flush();
            rest = &rest[cut..];
        }
    }

    fn fits(&self, chars: usize) -> bool {
        let separator = usize::from(!self.current.is_empty());
        self.current_chars + separator + chars <= self.limit
    }

    fn append(&mut self, line: &str, chars: usize) {
        if !self.current.is_empty() {
            self.current.push('\n');
            self.current_chars += 1;
        }
        self.current.push_str(line);
        self.current_chars += chars;
        self.header_only = false;
    }

    /// Emit the current chunk and start the next one, reopening the code
    /// block if one is open.
    fn flush(&mut self) {
        if let Some((bytes, chars)) = self.pending_opener.take() {
            // An opening fence with no code after it moves to the next chunk.
            self.current.truncate(bytes);
            self.current_chars = chars;
            self.emit();
            self.reopen_fence();
            return;
        }
        if self.header_only || self.current.is_empty() {
            return;
        }
        if self.fence.is_some() {
            self.current.push('\n');
            self.current.push_str(FENCE);
        }
        self.emit();
        self.reopen_fence();
    }

    fn emit(&mut self) {
        push_chunk(&mut self.chunks, &self.current);
        self.current.clear();
        self.current_chars = 0;
        self.header_only = false;
    }

    fn reopen_fence(&mut self) {
        if let Some(opener) = &self.fence {
            self.current.clone_from(opener);
            self.current_chars = opener.chars().count();
            self.header_only = true;
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.pending_opener = None;
        self.flush();
        self.chunks
    }
}

/// Byte offset at which to cut `text` so the head holds at most `room`
/// characters and at least one.
fn cut_point(text: &str, room: usize, in_code: bool) -> usize {
    let window_end = text
        .char_indices()
        .nth(room)
        .map_or(text.len(), |(index, _)| index);
    let head = &text[..window_end];

    let boundary = if in_code {
        None
    } else {
        last_markup_boundary(head)
    };
    boundary.unwrap_or_else(|| avoid_split_escape(head))
}

/// Last offset in escaped MarkdownV2 `head` at which no entity is open and
/// no escape pair is split.
fn last_markup_boundary(head: &str) -> Option<usize> {
    let mut bold = false;
    let mut italic = false;
    let mut strike = false;
    let mut code = false;
    let mut label = false;
    let mut url = false;
    let mut dangling_escape = false;
    let mut last = None;

    let mut chars = head.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        let neutral = !(bold || italic || strike || code || label || url);
        if index > 0 && neutral {
            last = Some(index);
        }

        match c {
            '\\' => dangling_escape = chars.next().is_none(),
            ')' if url => url = false,
            _ if url => {}
            '`' => code = !code,
            _ if code => {}
            '*' => bold = !bold,
            '_' => italic = !italic,
            '~' => strike = !strike,
            '[' => label = true,
            ']' if label => {
                label = false;
                if chars.next_if(|(_, next)| *next == '(').is_some() {
                    url = true;
                }
            }
            _ => {}
        }
    }

    let neutral = !(bold || italic || strike || code || label || url);
    if neutral && !dangling_escape && !head.is_empty() {
        last = Some(head.len());
    }
    last
}

/// Strip framing, escape and split raw job output. Empty output yields no
/// chunks.
pub fn render(raw: &str, limit: usize) -> Vec<String> {
    let body = strip_frame(raw);
    if body.is_empty() {
        return Vec::new();
    }
    split_message(&markdown::escape(&body), limit)
}

fn push_chunk(chunks: &mut Vec<String>, chunk: &str) {
    let chunk = chunk.trim();
    if !chunk.is_empty() {
        chunks.push(chunk.to_string());
    }
}

/// Byte length of `head` minus one when it ends in an unpaired backslash.
fn avoid_split_escape(head: &str) -> usize {
    let trailing = head.bytes().rev().take_while(|byte| *byte == b'\\').count();
    if trailing % 2 == 1 && head.len() > 1 {
        head.len() - 1
    } else {
        head.len()
    }
}
