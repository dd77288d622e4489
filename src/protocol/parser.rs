//! Request parser.

use super::framing::DELIMITER;

/// Command keyword of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    List,
    Get,
    Post,
    Delete,
    Status,
    /// Anything else, including non-UTF-8 input.
    Unknown,
}

impl Verb {
    /// Match a verb token, ignoring ASCII case.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("LIST") {
            Verb::List
        } else if token.eq_ignore_ascii_case("GET") {
            Verb::Get
        } else if token.eq_ignore_ascii_case("POST") {
            Verb::Post
        } else if token.eq_ignore_ascii_case("DELETE") {
            Verb::Delete
        } else if token.eq_ignore_ascii_case("STATUS") {
            Verb::Status
        } else {
            Verb::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::List => "LIST",
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
            Verb::Status => "STATUS",
            Verb::Unknown => "UNKNOWN",
        }
    }
}

/// A parsed request frame.
///
/// `args` holds every token after the verb exactly as split; arity is
/// checked by the dispatcher, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    verb: Verb,
    args: Vec<String>,
}

impl Request {
    pub fn new(verb: Verb, args: Vec<String>) -> Self {
        Self { verb, args }
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Serialize as a complete request frame.
    pub fn encode(&self) -> Vec<u8> {
        let args_len: usize = self.args.iter().map(|a| a.len() + 1).sum();
        let mut out = Vec::with_capacity(self.verb.as_str().len() + args_len + DELIMITER.len());
        out.extend_from_slice(self.verb.as_str().as_bytes());
        for arg in &self.args {
            out.push(b' ');
            out.extend_from_slice(arg.as_bytes());
        }
        out.extend_from_slice(DELIMITER);
        out
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Complete request with bytes consumed (delimiter included).
    Complete(Request, usize),
    /// Delimiter not seen yet.
    Incomplete,
}

/// Parse a request from the input buffer.
pub fn parse(input: &[u8]) -> ParseResult {
    match find_delimiter(input, 0) {
        Some(end) => ParseResult::Complete(parse_frame(&input[..end]), end + DELIMITER.len()),
        None => ParseResult::Incomplete,
    }
}

/// Parse the body of a frame (everything before the delimiter).
///
/// Surrounding ASCII whitespace is trimmed and the rest split on single
/// spaces, so repeated spaces produce empty tokens.
pub fn parse_frame(body: &[u8]) -> Request {
    let line = match std::str::from_utf8(body) {
        Ok(s) => s.trim_matches(|c: char| c.is_ascii_whitespace()),
        Err(_) => return Request::new(Verb::Unknown, Vec::new()),
    };

    let mut tokens = line.split(' ');
    let verb = tokens.next().map(Verb::from_token).unwrap_or(Verb::Unknown);
    let args = tokens.map(str::to_string).collect();

    Request::new(verb, args)
}

/// Find the delimiter, returning the position of its first byte.
///
/// Searching starts at `from`, letting a streaming caller skip bytes it
/// already scanned.
pub fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < DELIMITER.len() {
        return None;
    }
    (from..=buffer.len() - DELIMITER.len()).find(|&i| &buffer[i..i + DELIMITER.len()] == DELIMITER)
}
