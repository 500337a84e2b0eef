//! Single authenticated NNTP session
//!
//! Speaks the RFC 3977 subset the virtual filesystem needs: `AUTHINFO
//! USER/PASS`, `BODY <msgid>`, `STAT <msgid>`. Body reads parse the yEnc
//! prologue before any data byte is surfaced, so callers always have
//! `(part_offset, part_size, total_size)` up front.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsConnector;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::types::YencHeader;
use crate::yenc;

/// Decoded bytes accumulated per chunk before handing them to the caller
const CHUNK_TARGET: usize = 32 * 1024;

/// Lines scanned for `=ybegin` before a body is declared malformed
const MAX_PROLOGUE_LINES: usize = 32;

/// One authenticated NNTP session
pub struct NntpConnection {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    read_timeout: std::time::Duration,
    /// Protocol state: true when no body is pending on the wire
    clean: bool,
    /// Decoded data buffered while locating the prologue
    pending: Vec<u8>,
    /// True once the current body's terminator has been consumed
    body_done: bool,
}

impl NntpConnection {
    /// Connect, read the greeting, and authenticate
    pub async fn connect(server: &ServerConfig, client: &ClientConfig) -> Result<Self> {
        let addr = format!("{}:{}", server.host, server.port);

        let tcp = timeout(client.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Transient(format!("connect timeout to {addr}")))?
            .map_err(|e| Error::Transient(format!("connect to {addr} failed: {e}")))?;
        tcp.set_nodelay(true)?;

        let (reader, writer): (
            Box<dyn AsyncRead + Unpin + Send>,
            Box<dyn AsyncWrite + Unpin + Send>,
        ) = if server.tls {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| Error::Transient(format!("TLS setup failed: {e}")))?;
            let connector = Arc::new(TlsConnector::from(connector));
            let tls = timeout(client.connect_timeout, connector.connect(&server.host, tcp))
                .await
                .map_err(|_| Error::Transient(format!("TLS handshake timeout to {addr}")))?
                .map_err(|e| Error::Transient(format!("TLS handshake to {addr} failed: {e}")))?;
            let (r, w) = tokio::io::split(tls);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tokio::io::split(tcp);
            (Box::new(r), Box::new(w))
        };

        let mut conn = Self {
            writer,
            reader: BufReader::with_capacity(256 * 1024, reader),
            read_timeout: client.read_timeout,
            clean: true,
            pending: Vec::new(),
            body_done: true,
        };

        let greeting = conn.read_response().await?;
        if !greeting.starts_with("200") && !greeting.starts_with("201") {
            return Err(Error::Protocol(format!("unexpected greeting: {greeting}")));
        }

        conn.authenticate(server).await?;
        conn.clean = true;
        Ok(conn)
    }

    async fn authenticate(&mut self, server: &ServerConfig) -> Result<()> {
        let Some(user) = &server.user else {
            return Ok(());
        };

        self.send_command(&format!("AUTHINFO USER {user}")).await?;
        let response = self.read_response().await?;

        if response.starts_with("381") {
            let pass = server.pass.as_deref().unwrap_or_default();
            self.send_command(&format!("AUTHINFO PASS {pass}")).await?;
            let response = self.read_response().await?;
            if !response.starts_with("281") {
                // Only the code is reported; the rest of the line may echo
                // sensitive material
                let code = response.split_whitespace().next().unwrap_or("???");
                return Err(Error::Fatal(format!("authentication rejected ({code})")));
            }
        } else if !response.starts_with("281") {
            let code = response.split_whitespace().next().unwrap_or("???");
            return Err(Error::Fatal(format!("authentication rejected ({code})")));
        }

        Ok(())
    }

    /// Check article existence without transferring it
    pub async fn stat(&mut self, message_id: &str) -> Result<bool> {
        self.send_command(&format!("STAT <{message_id}>")).await?;
        let response = self.read_response().await?;
        if response.starts_with("223") {
            self.clean = true;
            return Ok(true);
        }
        if response.starts_with("430") || response.starts_with("423") {
            self.clean = true;
            return Ok(false);
        }
        Err(self.classify_status(&response, message_id))
    }

    /// Request a body and parse the yEnc prologue
    ///
    /// On success the connection holds an open body; the caller must consume
    /// it via [`next_chunk`](Self::next_chunk) until `None`, or accept that
    /// the connection is returned broken.
    pub async fn begin_body(&mut self, message_id: &str) -> Result<YencHeader> {
        self.send_command(&format!("BODY <{message_id}>")).await?;
        let response = self.read_response().await?;
        if !response.starts_with("222") {
            return Err(self.classify_status(&response, message_id));
        }

        // A body is now in flight; only the terminator restores clean state
        self.clean = false;
        self.body_done = false;
        self.pending.clear();

        let mut line = Vec::with_capacity(512);
        let mut ybegin = None;
        let mut scanned = 0usize;

        // Locate =ybegin, tolerating stray leading lines
        while ybegin.is_none() {
            scanned += 1;
            if scanned > MAX_PROLOGUE_LINES {
                return Err(Error::Protocol(format!(
                    "no =ybegin within {MAX_PROLOGUE_LINES} lines of <{message_id}>"
                )));
            }
            match self.read_body_line(&mut line).await? {
                BodyLine::Data(text) if text.starts_with(b"=ybegin ") => {
                    ybegin = Some(yenc::parse_ybegin(&String::from_utf8_lossy(text))?);
                }
                BodyLine::Data(_) => continue,
                BodyLine::Terminator => {
                    self.clean = true;
                    self.body_done = true;
                    return Err(Error::Protocol(format!(
                        "body of <{message_id}> ended before =ybegin"
                    )));
                }
            }
        }
        let ybegin = ybegin.unwrap_or_else(|| unreachable!("loop exits with Some"));

        // Next line is either =ypart or the first data line
        let ypart = match self.read_body_line(&mut line).await? {
            BodyLine::Data(text) if text.starts_with(b"=ypart ") => {
                Some(yenc::parse_ypart(&String::from_utf8_lossy(text))?)
            }
            BodyLine::Data(text) if text.starts_with(b"=yend") => {
                self.finish_body().await?;
                None
            }
            BodyLine::Data(text) => {
                yenc::decode_line(strip_newline(text), &mut self.pending);
                None
            }
            BodyLine::Terminator => {
                self.clean = true;
                self.body_done = true;
                None
            }
        };

        Ok(yenc::header_from_prologue(&ybegin, ypart.as_ref()))
    }

    /// Produce the next decoded chunk of the open body; `None` at EOF
    pub async fn next_chunk(&mut self) -> Result<Option<bytes::Bytes>> {
        if self.body_done {
            return Ok(self.take_pending());
        }

        let mut line = Vec::with_capacity(512);
        while self.pending.len() < CHUNK_TARGET {
            match self.read_body_line(&mut line).await? {
                BodyLine::Data(text) if text.starts_with(b"=yend") => {
                    self.finish_body().await?;
                    break;
                }
                BodyLine::Data(text) => {
                    yenc::decode_line(strip_newline(text), &mut self.pending);
                }
                BodyLine::Terminator => {
                    // Terminator without =yend: tolerated, trailer is optional
                    self.clean = true;
                    self.body_done = true;
                    break;
                }
            }
        }
        Ok(self.take_pending())
    }

    /// Read the remaining body without decoding it
    pub async fn drain_body(&mut self) -> Result<()> {
        let mut line = Vec::with_capacity(512);
        while !self.body_done {
            match self.read_body_line(&mut line).await? {
                BodyLine::Terminator => {
                    self.clean = true;
                    self.body_done = true;
                }
                BodyLine::Data(_) => {}
            }
        }
        self.pending.clear();
        Ok(())
    }

    /// True when the protocol state allows reuse
    pub fn is_clean(&self) -> bool {
        self.clean
    }

    /// Poison the connection so the pool closes it instead of reusing it
    pub fn mark_broken(&mut self) {
        self.clean = false;
    }

    /// Consume the =yend trailer's terminator
    async fn finish_body(&mut self) -> Result<()> {
        let mut line = Vec::with_capacity(16);
        loop {
            match self.read_body_line(&mut line).await? {
                BodyLine::Terminator => {
                    self.clean = true;
                    self.body_done = true;
                    return Ok(());
                }
                BodyLine::Data(_) => {}
            }
        }
    }

    fn take_pending(&mut self) -> Option<bytes::Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(bytes::Bytes::from(std::mem::take(&mut self.pending)))
        }
    }

    async fn read_body_line<'a>(&mut self, line: &'a mut Vec<u8>) -> Result<BodyLine<'a>> {
        line.clear();
        let n = timeout(self.read_timeout, self.reader.read_until(b'\n', line))
            .await
            .map_err(|_| {
                self.clean = false;
                Error::Transient("timeout reading article body".into())
            })?
            .map_err(|e| {
                self.clean = false;
                Error::Transient(format!("read error in article body: {e}"))
            })?;
        if n == 0 {
            self.clean = false;
            return Err(Error::Transient("connection closed mid-body".into()));
        }
        if line.as_slice() == b".\r\n" || line.as_slice() == b".\n" {
            return Ok(BodyLine::Terminator);
        }
        // Dot-stuffing: ".." at line start is a literal "."
        let start = if line.starts_with(b"..") { 1 } else { 0 };
        Ok(BodyLine::Data(&line[start..]))
    }

    async fn send_command(&mut self, command: &str) -> Result<()> {
        // A command in flight means the wire is dirty until its full response
        // cycle completes; a caller dropped mid-await must not return this
        // session to the idle set
        self.clean = false;
        let write = async {
            self.writer.write_all(command.as_bytes()).await?;
            self.writer.write_all(b"\r\n").await?;
            self.writer.flush().await
        };
        write.await.map_err(|e| {
            self.clean = false;
            Error::Transient(format!("write failed: {e}"))
        })
    }

    async fn read_response(&mut self) -> Result<String> {
        let mut response = String::new();
        timeout(self.read_timeout, self.reader.read_line(&mut response))
            .await
            .map_err(|_| {
                self.clean = false;
                Error::Transient("timeout waiting for response".into())
            })?
            .map_err(|e| {
                self.clean = false;
                Error::Transient(format!("read failed: {e}"))
            })?;
        if response.is_empty() {
            self.clean = false;
            return Err(Error::Transient("connection closed by server".into()));
        }
        while response.ends_with('\n') || response.ends_with('\r') {
            response.pop();
        }
        Ok(response)
    }

    /// Map a non-success response line to the error taxonomy
    fn classify_status(&mut self, response: &str, message_id: &str) -> Error {
        let code = response.split_whitespace().next().unwrap_or("");
        match code {
            "430" | "423" => {
                self.clean = true;
                Error::NotFound(format!("article <{message_id}>"))
            }
            "480" | "481" | "482" => {
                self.clean = true;
                Error::Unauthorized(format!("server demanded re-authentication ({code})"))
            }
            "400" | "503" => {
                self.clean = false;
                Error::Transient(format!("server unavailable ({response})"))
            }
            _ => {
                self.clean = false;
                Error::Protocol(format!("unexpected response: {response}"))
            }
        }
    }

    /// Best-effort QUIT before close
    pub async fn quit(&mut self) {
        let _ = self.send_command("QUIT").await;
        let _ = timeout(std::time::Duration::from_secs(2), async {
            let mut s = String::new();
            let _ = self.reader.read_line(&mut s).await;
        })
        .await;
    }
}

enum BodyLine<'a> {
    Data(&'a [u8]),
    Terminator,
}

fn strip_newline(line: &[u8]) -> &[u8] {
    let line = match line.last() {
        Some(b'\n') => &line[..line.len() - 1],
        _ => line,
    };
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}
