//! Shared test fixtures: an in-process scriptable NNTP server and NZB
//! builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use usenet_fs::yenc;

/// How the mock server answers for one message-id
#[derive(Clone)]
pub enum MockArticle {
    /// Serve a yEnc body
    Yenc {
        name: String,
        total: u64,
        part: Option<(u32, u64, u64)>,
        data: Vec<u8>,
    },
    /// 430 on STAT and BODY
    Missing,
    /// 400 then close the connection
    Transient,
}

impl MockArticle {
    /// Single-part article carrying the whole payload
    pub fn single(name: &str, data: &[u8]) -> Self {
        MockArticle::Yenc {
            name: name.to_string(),
            total: data.len() as u64,
            part: None,
            data: data.to_vec(),
        }
    }

    /// One part of a multi-part post
    pub fn part(name: &str, total: u64, number: u32, begin: u64, end: u64, data: &[u8]) -> Self {
        MockArticle::Yenc {
            name: name.to_string(),
            total,
            part: Some((number, begin, end)),
            data: data.to_vec(),
        }
    }
}

/// Scriptable in-process NNTP server
pub struct MockNntpServer {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub live_connections: Arc<AtomicUsize>,
    pub max_live_connections: Arc<AtomicUsize>,
    pub body_hits: Arc<AtomicUsize>,
    pub stat_hits: Arc<AtomicUsize>,
}

impl MockNntpServer {
    pub async fn start(articles: HashMap<String, MockArticle>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let articles = Arc::new(articles);

        let connections = Arc::new(AtomicUsize::new(0));
        let live_connections = Arc::new(AtomicUsize::new(0));
        let max_live_connections = Arc::new(AtomicUsize::new(0));
        let body_hits = Arc::new(AtomicUsize::new(0));
        let stat_hits = Arc::new(AtomicUsize::new(0));

        let server = Self {
            addr,
            connections: connections.clone(),
            live_connections: live_connections.clone(),
            max_live_connections: max_live_connections.clone(),
            body_hits: body_hits.clone(),
            stat_hits: stat_hits.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                connections.fetch_add(1, Ordering::SeqCst);
                let live = live_connections.clone();
                let max_live = max_live_connections.clone();
                let articles = articles.clone();
                let body_hits = body_hits.clone();
                let stat_hits = stat_hits.clone();
                tokio::spawn(async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    max_live.fetch_max(now, Ordering::SeqCst);
                    let _ = handle_connection(socket, &articles, &body_hits, &stat_hits).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        server
    }

    pub fn total_hits(&self) -> usize {
        self.body_hits.load(Ordering::SeqCst) + self.stat_hits.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    articles: &HashMap<String, MockArticle>,
    body_hits: &AtomicUsize,
    stat_hits: &AtomicUsize,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"200 mock ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();

        if command.starts_with("AUTHINFO USER") {
            write_half.write_all(b"381 password required\r\n").await?;
        } else if command.starts_with("AUTHINFO PASS") {
            write_half.write_all(b"281 authenticated\r\n").await?;
        } else if command.starts_with("STAT") {
            stat_hits.fetch_add(1, Ordering::SeqCst);
            match articles.get(&extract_id(command)) {
                Some(MockArticle::Yenc { .. }) => {
                    write_half.write_all(b"223 0 article exists\r\n").await?;
                }
                Some(MockArticle::Transient) => {
                    write_half.write_all(b"400 service unavailable\r\n").await?;
                    return Ok(());
                }
                _ => {
                    write_half.write_all(b"430 no such article\r\n").await?;
                }
            }
        } else if command.starts_with("BODY") {
            body_hits.fetch_add(1, Ordering::SeqCst);
            match articles.get(&extract_id(command)) {
                Some(MockArticle::Yenc {
                    name,
                    total,
                    part,
                    data,
                }) => {
                    write_half.write_all(b"222 0 body follows\r\n").await?;
                    let body = yenc::encode_article(name, *total, *part, data);
                    write_stuffed(&mut write_half, &body).await?;
                    write_half.write_all(b".\r\n").await?;
                }
                Some(MockArticle::Transient) => {
                    write_half.write_all(b"400 service unavailable\r\n").await?;
                    return Ok(());
                }
                _ => {
                    write_half.write_all(b"430 no such article\r\n").await?;
                }
            }
        } else if command.starts_with("QUIT") {
            write_half.write_all(b"205 bye\r\n").await?;
            return Ok(());
        } else {
            write_half.write_all(b"500 unknown command\r\n").await?;
        }
    }
}

/// Write body lines with NNTP dot-stuffing
async fn write_stuffed(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    body: &[u8],
) -> std::io::Result<()> {
    for raw_line in body.split(|&b| b == b'\n') {
        let line = match raw_line.last() {
            Some(b'\r') => &raw_line[..raw_line.len() - 1],
            _ => raw_line,
        };
        if line.is_empty() && raw_line.is_empty() {
            continue;
        }
        if line.starts_with(b".") {
            write_half.write_all(b".").await?;
        }
        write_half.write_all(line).await?;
        write_half.write_all(b"\r\n").await?;
    }
    Ok(())
}

fn extract_id(command: &str) -> String {
    match (command.find('<'), command.find('>')) {
        (Some(start), Some(end)) if end > start => command[start + 1..end].to_string(),
        _ => String::new(),
    }
}

/// Server config pointing at a mock server
pub fn server_config(id: &str, addr: SocketAddr, priority: i32) -> usenet_fs::ServerConfig {
    usenet_fs::ServerConfig {
        id: id.to_string(),
        name: id.to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        tls: false,
        user: Some("user".to_string()),
        pass: Some("pass".to_string()),
        max_connections: 4,
        priority,
        enabled: true,
        retention_days: None,
    }
}

/// Split a payload into fixed-size articles and register them with ids
/// `{prefix}{k}@test`; returns the NZB `<segments>` XML and the article map.
pub fn split_into_articles(
    name: &str,
    payload: &[u8],
    part_size: usize,
    prefix: &str,
) -> (String, HashMap<String, MockArticle>) {
    let total = payload.len() as u64;
    let mut segments_xml = String::new();
    let mut articles = HashMap::new();
    for (i, chunk) in payload.chunks(part_size).enumerate() {
        let number = (i + 1) as u32;
        let begin = (i * part_size) as u64 + 1;
        let end = begin + chunk.len() as u64 - 1;
        let message_id = format!("{prefix}{number}@test");
        segments_xml.push_str(&format!(
            "      <segment bytes=\"{}\" number=\"{}\">{}</segment>\n",
            chunk.len(),
            number,
            message_id
        ));
        articles.insert(
            message_id,
            MockArticle::part(name, total, number, begin, end, chunk),
        );
    }
    (segments_xml, articles)
}

/// Assemble an NZB document from `(subject_name, segments_xml)` files
pub fn build_nzb(title: &str, files: &[(&str, &str)]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
    );
    xml.push_str(&format!(
        "  <head>\n    <meta type=\"title\">{title}</meta>\n  </head>\n"
    ));
    for (name, segments) in files {
        xml.push_str(&format!(
            "  <file poster=\"tester@example.com\" date=\"1700000000\" \
             subject=\"[1/1] - &quot;{name}&quot; yEnc\">\n\
             \x20   <groups><group>alt.binaries.test</group></groups>\n\
             \x20   <segments>\n{segments}    </segments>\n  </file>\n"
        ));
    }
    xml.push_str("</nzb>\n");
    xml
}

/// Deterministic byte pattern for round-trip checks
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}
