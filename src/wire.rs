//! Memcached text protocol codec
//!
//! One request is a whitespace-separated header line terminated by `\r\n`;
//! store commands carry a data block of a declared byte length, also
//! terminated by `\r\n` (the payload itself may contain `\r\n`). One
//! response is zero or more `VALUE` records followed by a status line.
//!
//! The parser is pure (`&str` in, `Request` out); [`Connection`] does the
//! framing over a buffered socket and is the only I/O in this module.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

/// Response status codes of the text protocol
pub mod code {
    pub const STORED: &str = "STORED";
    pub const NOT_STORED: &str = "NOT_STORED";
    pub const EXISTS: &str = "EXISTS";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const DELETED: &str = "DELETED";
    pub const TOUCHED: &str = "TOUCHED";
    pub const END: &str = "END";
}

/// The closed command set of the protocol
///
/// Anything else parses as `Other` and is answered with an `ERROR` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get,
    Gets,
    Set,
    Add,
    Replace,
    Cas,
    Append,
    Prepend,
    Incr,
    Decr,
    Delete,
    Touch,
    Version,
    Quit,
    Other(String),
}

/// One fully decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// Keys in client order; single-key commands use the first entry
    pub keys: Vec<String>,
    /// Flags as decimal text, preserved verbatim
    pub flags: String,
    /// Expiration in seconds; 0 means no expiration
    pub exptime: u64,
    /// Delta for `incr`/`decr`
    pub delta: i64,
    /// Data block for store commands
    pub data: Vec<u8>,
    /// CAS token presented by a `cas` request
    pub cas: String,
    /// Suppress the response on success
    pub noreply: bool,
}

impl Request {
    fn new(command: Command) -> Self {
        Self {
            command,
            keys: Vec::new(),
            flags: String::new(),
            exptime: 0,
            delta: 0,
            data: Vec::new(),
            cas: String::new(),
            noreply: false,
        }
    }

    /// The single key of a single-key command
    #[must_use]
    pub fn key(&self) -> &str {
        self.keys.first().map_or("", String::as_str)
    }
}

/// A request the codec could not decode
///
/// The text becomes the body of a `CLIENT_ERROR` line; the connection
/// stays open and resumes at the next line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MalformedRequest(String);

impl MalformedRequest {
    fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

fn bad_line() -> MalformedRequest {
    MalformedRequest::new("bad command line format")
}

/// One `VALUE` record within a retrieval response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub key: String,
    pub flags: String,
    pub data: Vec<u8>,
    /// CAS token, emitted only for `gets`
    pub cas: Option<String>,
}

/// One response: value records followed by a status line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub values: Vec<Value>,
    pub status: String,
}

impl Response {
    /// A bare status-line response
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            values: Vec::new(),
            status: status.into(),
        }
    }

    /// `ERROR <text>` - unknown command
    pub fn error(text: impl AsRef<str>) -> Self {
        Self::status(format!("ERROR {}", text.as_ref()))
    }

    /// `CLIENT_ERROR <text>` - the client sent something wrong
    pub fn client_error(text: impl AsRef<str>) -> Self {
        Self::status(format!("CLIENT_ERROR {}", text.as_ref()))
    }

    /// `SERVER_ERROR <text>` - the bridge or its backend failed
    pub fn server_error(text: impl AsRef<str>) -> Self {
        Self::status(format!("SERVER_ERROR {}", text.as_ref()))
    }

    /// Serialize to the on-the-wire byte sequence
    pub fn encode(&self, buf: &mut BytesMut) {
        for value in &self.values {
            buf.extend_from_slice(b"VALUE ");
            buf.extend_from_slice(value.key.as_bytes());
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(value.flags.as_bytes());
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(value.data.len().to_string().as_bytes());
            if let Some(cas) = &value.cas {
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(cas.as_bytes());
            }
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(&value.data);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(self.status.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

/// Outcome of reading one request from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed request
    Request(Request),
    /// Undecodable input; reply `CLIENT_ERROR` and keep reading
    Malformed(MalformedRequest),
}

struct ParsedHeader {
    request: Request,
    /// Declared data-block length for store commands
    body_len: Option<usize>,
}

impl ParsedHeader {
    fn bare(request: Request) -> Self {
        Self {
            request,
            body_len: None,
        }
    }
}

fn parse_header(line: &str) -> Result<ParsedHeader, MalformedRequest> {
    let mut parts = line.split_whitespace();
    let Some(name) = parts.next() else {
        return Err(bad_line());
    };
    let args: Vec<&str> = parts.collect();

    match name {
        "get" | "gets" => {
            if args.is_empty() {
                return Err(bad_line());
            }
            let command = if name == "get" {
                Command::Get
            } else {
                Command::Gets
            };
            let mut request = Request::new(command);
            request.keys = args.iter().map(ToString::to_string).collect();
            Ok(ParsedHeader::bare(request))
        }
        "set" | "add" | "replace" | "cas" | "append" | "prepend" => parse_store(name, &args),
        "incr" | "decr" => parse_numeric(name, &args),
        "delete" => {
            let (keys, noreply) = match args.split_last() {
                Some((last, rest)) if *last == "noreply" => (rest, true),
                _ => (args.as_slice(), false),
            };
            if keys.is_empty() {
                return Err(bad_line());
            }
            let mut request = Request::new(Command::Delete);
            request.keys = keys.iter().map(ToString::to_string).collect();
            request.noreply = noreply;
            Ok(ParsedHeader::bare(request))
        }
        "touch" => {
            let (key, exptime, noreply) = match args.as_slice() {
                [key, exptime] => (key, exptime, false),
                [key, exptime, tail] if *tail == "noreply" => (key, exptime, true),
                _ => return Err(bad_line()),
            };
            let mut request = Request::new(Command::Touch);
            request.keys = vec![(*key).to_string()];
            request.exptime = exptime.parse().map_err(|_| bad_line())?;
            request.noreply = noreply;
            Ok(ParsedHeader::bare(request))
        }
        "version" => Ok(ParsedHeader::bare(Request::new(Command::Version))),
        "quit" => Ok(ParsedHeader::bare(Request::new(Command::Quit))),
        other => Ok(ParsedHeader::bare(Request::new(Command::Other(
            other.to_string(),
        )))),
    }
}

fn parse_store(name: &str, args: &[&str]) -> Result<ParsedHeader, MalformedRequest> {
    let command = match name {
        "set" => Command::Set,
        "add" => Command::Add,
        "replace" => Command::Replace,
        "cas" => Command::Cas,
        "append" => Command::Append,
        _ => Command::Prepend,
    };
    let is_cas = command == Command::Cas;

    // <key> <flags> <exptime> <bytes> [<cas unique>] [noreply]
    let (key, flags, exptime, bytes, cas, noreply) = match (is_cas, args) {
        (false, [key, flags, exptime, bytes]) => (key, flags, exptime, bytes, None, false),
        (false, [key, flags, exptime, bytes, tail]) if *tail == "noreply" => {
            (key, flags, exptime, bytes, None, true)
        }
        (true, [key, flags, exptime, bytes, cas]) => {
            (key, flags, exptime, bytes, Some(*cas), false)
        }
        (true, [key, flags, exptime, bytes, cas, tail]) if *tail == "noreply" => {
            (key, flags, exptime, bytes, Some(*cas), true)
        }
        _ => return Err(bad_line()),
    };

    // Flags are preserved verbatim but must at least be an unsigned decimal.
    flags.parse::<u32>().map_err(|_| bad_line())?;

    let mut request = Request::new(command);
    request.keys = vec![(*key).to_string()];
    request.flags = (*flags).to_string();
    request.exptime = exptime.parse().map_err(|_| bad_line())?;
    let body_len: usize = bytes.parse().map_err(|_| bad_line())?;
    if let Some(cas) = cas {
        cas.parse::<u64>().map_err(|_| bad_line())?;
        request.cas = cas.to_string();
    }
    request.noreply = noreply;

    Ok(ParsedHeader {
        request,
        body_len: Some(body_len),
    })
}

fn parse_numeric(name: &str, args: &[&str]) -> Result<ParsedHeader, MalformedRequest> {
    let (key, delta, noreply) = match args {
        [key, delta] => (key, delta, false),
        [key, delta, tail] if *tail == "noreply" => (key, delta, true),
        _ => return Err(bad_line()),
    };
    let command = if name == "incr" {
        Command::Incr
    } else {
        Command::Decr
    };
    let mut request = Request::new(command);
    request.keys = vec![(*key).to_string()];
    request.delta = delta
        .parse()
        .map_err(|_| MalformedRequest::new("invalid numeric delta argument"))?;
    request.noreply = noreply;
    Ok(ParsedHeader::bare(request))
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// A client connection with protocol framing
///
/// Wraps the socket in a buffered stream and exposes request/response
/// framing; byte-level details stay in here.
pub struct Connection<S> {
    stream: BufStream<S>,
    line: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap a socket
    pub fn new(socket: S) -> Self {
        Self {
            stream: BufStream::new(socket),
            line: Vec::with_capacity(256),
        }
    }

    /// Read one request from the wire
    ///
    /// Returns `Ok(None)` on a clean EOF at a request boundary.
    ///
    /// # Errors
    ///
    /// I/O errors (including EOF inside a data block) are fatal to the
    /// connection.
    pub async fn read_request(&mut self) -> std::io::Result<Option<Inbound>> {
        self.line.clear();
        let read = self.stream.read_until(b'\n', &mut self.line).await?;
        if read == 0 {
            return Ok(None);
        }

        let Ok(text) = std::str::from_utf8(strip_line_ending(&self.line)) else {
            return Ok(Some(Inbound::Malformed(bad_line())));
        };
        let parsed = match parse_header(text) {
            Ok(parsed) => parsed,
            Err(err) => return Ok(Some(Inbound::Malformed(err))),
        };

        let mut request = parsed.request;
        if let Some(len) = parsed.body_len {
            let mut body = vec![0u8; len + 2];
            self.stream.read_exact(&mut body).await?;
            if !body.ends_with(b"\r\n") {
                return Ok(Some(Inbound::Malformed(MalformedRequest::new(
                    "bad data chunk",
                ))));
            }
            body.truncate(len);
            request.data = body;
        }
        Ok(Some(Inbound::Request(request)))
    }

    /// Encode and write one response, flushing the stream
    ///
    /// # Errors
    ///
    /// I/O errors are fatal to the connection; a partially written response
    /// must never be followed by another.
    pub async fn write_response(&mut self, response: &Response) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(64);
        response.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(line: &str) -> ParsedHeader {
        parse_header(line).expect("header should parse")
    }

    #[test]
    fn parses_get_with_multiple_keys() {
        let parsed = header("get one two three");
        assert_eq!(parsed.request.command, Command::Get);
        assert_eq!(parsed.request.keys, ["one", "two", "three"]);
        assert_eq!(parsed.body_len, None);
    }

    #[test]
    fn parses_set_header() {
        let parsed = header("set hello 42 120 5");
        assert_eq!(parsed.request.command, Command::Set);
        assert_eq!(parsed.request.key(), "hello");
        assert_eq!(parsed.request.flags, "42");
        assert_eq!(parsed.request.exptime, 120);
        assert_eq!(parsed.body_len, Some(5));
        assert!(!parsed.request.noreply);
    }

    #[test]
    fn parses_noreply_modifier() {
        assert!(header("set hello 0 0 5 noreply").request.noreply);
        assert!(header("delete hello noreply").request.noreply);
        assert!(header("incr hello 1 noreply").request.noreply);
        assert!(header("touch hello 30 noreply").request.noreply);
    }

    #[test]
    fn parses_cas_header() {
        let parsed = header("cas hello 0 0 3 123456");
        assert_eq!(parsed.request.command, Command::Cas);
        assert_eq!(parsed.request.cas, "123456");
        assert_eq!(parsed.body_len, Some(3));
    }

    #[test]
    fn parses_numeric_commands() {
        let parsed = header("incr counter 9");
        assert_eq!(parsed.request.command, Command::Incr);
        assert_eq!(parsed.request.delta, 9);
        assert_eq!(header("decr counter 3").request.command, Command::Decr);
    }

    #[test]
    fn parses_delete_with_multiple_keys() {
        let parsed = header("delete a b c");
        assert_eq!(parsed.request.command, Command::Delete);
        assert_eq!(parsed.request.keys, ["a", "b", "c"]);
    }

    #[test]
    fn unknown_command_is_preserved() {
        let parsed = header("stats items");
        assert_eq!(
            parsed.request.command,
            Command::Other("stats".to_string())
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(parse_header("").is_err());
        assert!(parse_header("get").is_err());
        assert!(parse_header("set hello 0 0").is_err());
        assert!(parse_header("set hello notaflag 0 5").is_err());
        assert!(parse_header("set hello 0 0 notbytes").is_err());
        assert!(parse_header("cas hello 0 0 3 notatoken").is_err());
        assert!(parse_header("delete").is_err());
        assert!(parse_header("touch hello").is_err());
        assert!(parse_header("incr hello abc").is_err());
    }

    #[test]
    fn encodes_retrieval_response() {
        let response = Response {
            values: vec![
                Value {
                    key: "hello".to_string(),
                    flags: "42".to_string(),
                    data: b"world".to_vec(),
                    cas: None,
                },
                Value {
                    key: "k".to_string(),
                    flags: "0".to_string(),
                    data: b"v".to_vec(),
                    cas: Some("77".to_string()),
                },
            ],
            status: code::END.to_string(),
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(
            &buf[..],
            b"VALUE hello 42 5\r\nworld\r\nVALUE k 0 1 77\r\nv\r\nEND\r\n".as_slice()
        );
    }

    #[test]
    fn encodes_status_line() {
        let mut buf = BytesMut::new();
        Response::server_error("shutting down").encode(&mut buf);
        assert_eq!(&buf[..], b"SERVER_ERROR shutting down\r\n".as_slice());
    }

    #[tokio::test]
    async fn connection_reads_request_with_binary_body() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server);

        let mut client = client;
        client
            .write_all(b"set bin 0 0 6\r\nab\r\ncd\r\n")
            .await
            .unwrap();

        let inbound = connection.read_request().await.unwrap().unwrap();
        let Inbound::Request(request) = inbound else {
            panic!("expected a request");
        };
        assert_eq!(request.command, Command::Set);
        assert_eq!(request.data, b"ab\r\ncd");
    }

    #[tokio::test]
    async fn connection_flags_bad_data_chunk() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server);

        let mut client = client;
        client.write_all(b"set k 0 0 2\r\nabXX").await.unwrap();

        let inbound = connection.read_request().await.unwrap().unwrap();
        assert!(matches!(inbound, Inbound::Malformed(_)));
    }

    #[tokio::test]
    async fn connection_reports_eof() {
        let (client, server) = tokio::io::duplex(16);
        let mut connection = Connection::new(server);
        drop(client);
        assert_eq!(connection.read_request().await.unwrap(), None);
    }
}
