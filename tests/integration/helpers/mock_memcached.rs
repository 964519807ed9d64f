//! Mock memcached server for the remote cache tier
//!
//! Speaks the subset of the ASCII protocol the remote tier uses
//! (`get`, `set`, `delete`, `version`) and can:
//! - Simulate failures (connection closed on every command)
//! - Always miss on reads
//! - Add latency before each response
//! - Record commands for assertions

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

/// Response mode for the mock server
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum ResponseMode {
    /// Parse and answer commands against the in-memory store
    Normal,
    /// Answer every `get` with `END`
    AlwaysMiss,
    /// Close the connection instead of answering
    Failure,
}

/// Statistics tracked by the mock server
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub requests: usize,
    pub gets: usize,
    pub sets: usize,
    pub deletes: usize,
    pub versions: usize,
}

/// Mock memcached server
pub struct MockMemcached {
    addr: String,
    response_mode: Arc<Mutex<ResponseMode>>,
    latency: Arc<Mutex<Option<Duration>>>,
    storage: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    stats: Arc<Mutex<MockStats>>,
    commands: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl MockMemcached {
    /// Start a mock with default settings
    pub async fn new() -> std::io::Result<Self> {
        MockMemcachedBuilder::new().build().await
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn set_response_mode(&self, mode: ResponseMode) {
        *self.response_mode.lock().unwrap() = mode;
    }

    pub fn set_latency(&self, duration: Option<Duration>) {
        *self.latency.lock().unwrap() = duration;
    }

    pub fn stats(&self) -> MockStats {
        self.stats.lock().unwrap().clone()
    }

    /// Command lines received so far, without data blocks
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn get_stored_value(&self, key: &str) -> Option<Vec<u8>> {
        self.storage.lock().unwrap().get(key).cloned()
    }

    pub fn set_stored_value(&self, key: &str, value: &[u8]) {
        self.storage
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockMemcached {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Builder for [`MockMemcached`]
pub struct MockMemcachedBuilder {
    response_mode: ResponseMode,
    latency: Option<Duration>,
    initial_data: HashMap<String, Vec<u8>>,
}

#[allow(dead_code)]
impl MockMemcachedBuilder {
    pub fn new() -> Self {
        Self {
            response_mode: ResponseMode::Normal,
            latency: None,
            initial_data: HashMap::new(),
        }
    }

    pub fn response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    pub fn latency(mut self, duration: Duration) -> Self {
        self.latency = Some(duration);
        self
    }

    pub fn with_data(mut self, key: &str, value: &[u8]) -> Self {
        self.initial_data.insert(key.to_string(), value.to_vec());
        self
    }

    pub async fn build(self) -> std::io::Result<MockMemcached> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();

        let response_mode = Arc::new(Mutex::new(self.response_mode));
        let latency = Arc::new(Mutex::new(self.latency));
        let storage = Arc::new(Mutex::new(self.initial_data));
        let stats = Arc::new(Mutex::new(MockStats::default()));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        let server = MockServer {
            response_mode: Arc::clone(&response_mode),
            latency: Arc::clone(&latency),
            storage: Arc::clone(&storage),
            stats: Arc::clone(&stats),
            commands: Arc::clone(&commands),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let server = server.clone();
                                tokio::spawn(async move {
                                    let _ = server.handle_connection(stream).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(MockMemcached {
            addr,
            response_mode,
            latency,
            storage,
            stats,
            commands,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Default for MockMemcachedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct MockServer {
    response_mode: Arc<Mutex<ResponseMode>>,
    latency: Arc<Mutex<Option<Duration>>>,
    storage: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    stats: Arc<Mutex<MockStats>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end().to_string();
            let parts: Vec<&str> = line.split_whitespace().collect();
            let Some(verb) = parts.first().map(|v| v.to_lowercase()) else {
                continue;
            };

            // Data block of a set arrives before the reply is due
            let data = if verb == "set" {
                let bytes: usize = parts.get(4).and_then(|b| b.parse().ok()).unwrap_or(0);
                let mut block = vec![0u8; bytes + 2];
                reader.read_exact(&mut block).await?;
                block.truncate(bytes);
                Some(block)
            } else {
                None
            };

            self.record(&verb, &line);

            let delay = *self.latency.lock().unwrap();
            if let Some(delay) = delay {
                sleep(delay).await;
            }

            let mode = self.response_mode.lock().unwrap().clone();
            let response = match mode {
                ResponseMode::Failure => return Ok(()),
                ResponseMode::AlwaysMiss if verb == "get" || verb == "gets" => b"END\r\n".to_vec(),
                _ => self.respond(&verb, &parts, data),
            };

            write_half.write_all(&response).await?;
            write_half.flush().await?;
        }
    }

    fn record(&self, verb: &str, line: &str) {
        self.commands.lock().unwrap().push(line.to_string());
        let mut stats = self.stats.lock().unwrap();
        stats.requests += 1;
        match verb {
            "get" | "gets" => stats.gets += 1,
            "set" => stats.sets += 1,
            "delete" => stats.deletes += 1,
            "version" => stats.versions += 1,
            _ => {}
        }
    }

    fn respond(&self, verb: &str, parts: &[&str], data: Option<Vec<u8>>) -> Vec<u8> {
        match verb {
            "get" | "gets" => {
                let storage = self.storage.lock().unwrap();
                let mut out = Vec::new();
                for key in &parts[1..] {
                    if let Some(value) = storage.get(*key) {
                        out.extend_from_slice(
                            format!("VALUE {} 0 {}\r\n", key, value.len()).as_bytes(),
                        );
                        out.extend_from_slice(value);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                out.extend_from_slice(b"END\r\n");
                out
            }
            "set" => match (parts.get(1), data) {
                (Some(key), Some(value)) => {
                    self.storage.lock().unwrap().insert(key.to_string(), value);
                    b"STORED\r\n".to_vec()
                }
                _ => b"ERROR\r\n".to_vec(),
            },
            "delete" => match parts.get(1) {
                Some(key) if self.storage.lock().unwrap().remove(*key).is_some() => {
                    b"DELETED\r\n".to_vec()
                }
                Some(_) => b"NOT_FOUND\r\n".to_vec(),
                None => b"ERROR\r\n".to_vec(),
            },
            "version" => b"VERSION 1.6.21-mock\r\n".to_vec(),
            _ => b"ERROR\r\n".to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_memcached_basic() {
        let mock = MockMemcached::new().await.unwrap();
        assert!(!mock.addr().is_empty());
        mock.shutdown();
    }

    #[tokio::test]
    async fn test_mock_memcached_with_builder() {
        let mock = MockMemcachedBuilder::new()
            .response_mode(ResponseMode::AlwaysMiss)
            .latency(Duration::from_millis(10))
            .with_data("testkey", b"testvalue")
            .build()
            .await
            .unwrap();

        assert_eq!(mock.get_stored_value("testkey").as_deref(), Some(&b"testvalue"[..]));
        mock.shutdown();
    }
}
