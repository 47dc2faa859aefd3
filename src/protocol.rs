//! getput line protocol parser and response generator.
//!
//! Client lines are `<verb> [filename]`, tokens separated by spaces and
//! terminated by LF or CRLF. Verbs are matched case-insensitively:
//! - Transfer: get, put
//! - Other: bye
//!
//! Server replies are `SERVER <code> <phrase>\n` status lines. They are not
//! HTTP: there is no header block and no length field.

/// Sent unconditionally when a connection is accepted.
pub const GREETING: &[u8] = b"HELLO\n";

/// Marks the end of a file body, in both directions.
pub const TERMINATOR: &[u8] = b"\n\n";

/// Bytes that separate tokens on a command line.
const DELIMITERS: &[u8] = b" \r\n";

/// Parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Download a file
    Get(Option<String>),

    /// Upload a file; the body follows the command line
    Put(Option<String>),

    /// Close the session
    Bye,

    /// Any other verb
    Unknown(String),
}

/// Parse one command line.
///
/// Returns `None` when the line holds no tokens at all. Tokens past the
/// second are ignored.
pub fn parse(line: &[u8]) -> Option<Command> {
    let mut tokens = line
        .split(|b| DELIMITERS.contains(b))
        .filter(|token| !token.is_empty());

    let verb = tokens.next()?;
    let filename = tokens
        .next()
        .map(|name| String::from_utf8_lossy(name).into_owned());

    let command = if verb.eq_ignore_ascii_case(b"GET") {
        Command::Get(filename)
    } else if verb.eq_ignore_ascii_case(b"PUT") {
        Command::Put(filename)
    } else if verb.eq_ignore_ascii_case(b"BYE") {
        Command::Bye
    } else {
        Command::Unknown(String::from_utf8_lossy(verb).into_owned())
    };

    Some(command)
}

/// Position just past the first LF in `buffer`.
pub fn find_line_end(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n').map(|pos| pos + 1)
}

/// Status lines the server can send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NotFound,
    GetError,
    PutError,
    CommandError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::NotFound => 404,
            Status::GetError => 500,
            Status::PutError => 501,
            Status::CommandError => 502,
        }
    }

    /// The full status line, newline included.
    pub fn line(&self) -> &'static [u8] {
        match self {
            Status::Ok => b"SERVER 200 OK\n",
            Status::Created => b"SERVER 201 Created\n",
            Status::NotFound => b"SERVER 404 Not Found\n",
            Status::GetError => b"SERVER 500 Get Error\n",
            Status::PutError => b"SERVER 501 Put Error\n",
            Status::CommandError => b"SERVER 502 Command Error\n",
        }
    }
}

/// Tracks the run of consecutive newlines in an upload body.
///
/// Any byte other than `\n` resets the run; the body ends once two
/// newlines arrive back to back. The run survives across chunks, so a
/// terminator split over two reads is still found.
#[derive(Debug, Default)]
pub struct TerminatorScanner {
    run: u8,
}

impl TerminatorScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `chunk` and return how many of its bytes belong to the body.
    ///
    /// `Some(n)` means the terminator ends at `chunk[n - 1]`; `None` means
    /// the whole chunk is body and more is expected.
    pub fn scan(&mut self, chunk: &[u8]) -> Option<usize> {
        for (i, &b) in chunk.iter().enumerate() {
            if b == b'\n' {
                self.run += 1;
                if self.run == 2 {
                    return Some(i + 1);
                }
            } else {
                self.run = 0;
            }
        }
        None
    }

    pub fn is_complete(&self) -> bool {
        self.run >= 2
    }
}
