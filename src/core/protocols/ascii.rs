use super::ProtocolError;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Longest key the memcached text protocol accepts
pub const MAX_KEY_LEN: usize = 250;

/// ASCII protocol commands issued by the remote cache tier
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiCommand {
    Get {
        keys: Vec<String>,
    },
    Set {
        key: String,
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },
    Delete {
        key: String,
        noreply: bool,
    },
    Version,
}

/// ASCII protocol response types
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiResponse {
    Value {
        key: String,
        flags: u32,
        bytes: usize,
        data: Vec<u8>,
    },
    Stored,
    NotStored,
    NotFound,
    Deleted,
    Error(String),
    ClientError(String),
    ServerError(String),
    Version(String),
    End,
}

impl AsciiCommand {
    /// Render the command line (without any data block)
    pub fn encode(&self) -> String {
        match self {
            AsciiCommand::Get { keys } => format!("get {}\r\n", keys.join(" ")),
            AsciiCommand::Set {
                key,
                flags,
                exptime,
                bytes,
                noreply,
            } => format!(
                "set {} {} {} {}{}\r\n",
                key,
                flags,
                exptime,
                bytes,
                if *noreply { " noreply" } else { "" }
            ),
            AsciiCommand::Delete { key, noreply } => format!(
                "delete {}{}\r\n",
                key,
                if *noreply { " noreply" } else { "" }
            ),
            AsciiCommand::Version => "version\r\n".to_string(),
        }
    }
}

impl AsciiResponse {
    /// Parse an ASCII response from a line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();

        if line.starts_with("VALUE ") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return Err(ProtocolError::ParseError(
                    "Invalid VALUE response".to_string(),
                ));
            }
            let key = parts[1].to_string();
            let flags = parts[2]
                .parse::<u32>()
                .map_err(|_| ProtocolError::ParseError("Invalid flags".to_string()))?;
            let bytes = parts[3]
                .parse::<usize>()
                .map_err(|_| ProtocolError::ParseError("Invalid bytes".to_string()))?;
            Ok(AsciiResponse::Value {
                key,
                flags,
                bytes,
                data: Vec::new(),
            })
        } else {
            match line {
                "STORED" => Ok(AsciiResponse::Stored),
                "NOT_STORED" => Ok(AsciiResponse::NotStored),
                "NOT_FOUND" => Ok(AsciiResponse::NotFound),
                "DELETED" => Ok(AsciiResponse::Deleted),
                "END" => Ok(AsciiResponse::End),
                _ if line.starts_with("CLIENT_ERROR") => {
                    Ok(AsciiResponse::ClientError(line.to_string()))
                }
                _ if line.starts_with("SERVER_ERROR") => {
                    Ok(AsciiResponse::ServerError(line.to_string()))
                }
                _ if line.starts_with("ERROR") => Ok(AsciiResponse::Error(line.to_string())),
                _ if line.starts_with("VERSION ") => {
                    let version = line.strip_prefix("VERSION ").unwrap_or("").to_string();
                    Ok(AsciiResponse::Version(version))
                }
                _ => Err(ProtocolError::ParseError(format!(
                    "Unknown response: {}",
                    line
                ))),
            }
        }
    }
}

/// Whether a key can travel over the text protocol as-is
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b > b' ' && b != 0x7f)
}

/// Fetch several keys with one `get` round trip.
///
/// Keys that are missing on the server are simply absent from the result.
pub async fn get_many<S>(
    stream: &mut S,
    keys: &[String],
) -> Result<HashMap<String, Vec<u8>>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if keys.is_empty() {
        return Ok(HashMap::new());
    }

    let command = AsciiCommand::Get {
        keys: keys.to_vec(),
    };
    send(stream, command.encode().as_bytes(), None).await?;

    let mut reader = BufReader::new(stream);
    let mut found = HashMap::with_capacity(keys.len());
    loop {
        match read_response(&mut reader).await? {
            AsciiResponse::Value { key, data, .. } => {
                found.insert(key, data);
            }
            AsciiResponse::End => return Ok(found),
            other => return Err(unexpected(other)),
        }
    }
}

/// Store a value; succeeds only on `STORED`
pub async fn set<S>(
    stream: &mut S,
    key: &str,
    value: &[u8],
    exptime: u32,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = AsciiCommand::Set {
        key: key.to_string(),
        flags: 0,
        exptime,
        bytes: value.len(),
        noreply: false,
    };
    send(stream, command.encode().as_bytes(), Some(value)).await?;

    let mut reader = BufReader::new(stream);
    match read_response(&mut reader).await? {
        AsciiResponse::Stored => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// Delete a key; returns whether it existed
pub async fn delete<S>(stream: &mut S, key: &str) -> Result<bool, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = AsciiCommand::Delete {
        key: key.to_string(),
        noreply: false,
    };
    send(stream, command.encode().as_bytes(), None).await?;

    let mut reader = BufReader::new(stream);
    match read_response(&mut reader).await? {
        AsciiResponse::Deleted => Ok(true),
        AsciiResponse::NotFound => Ok(false),
        other => Err(unexpected(other)),
    }
}

/// Ask the server for its version (used as the liveness probe)
pub async fn version<S>(stream: &mut S) -> Result<String, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(stream, AsciiCommand::Version.encode().as_bytes(), None).await?;

    let mut reader = BufReader::new(stream);
    match read_response(&mut reader).await? {
        AsciiResponse::Version(version) => Ok(version),
        other => Err(unexpected(other)),
    }
}

async fn send<S>(stream: &mut S, line: &[u8], data: Option<&[u8]>) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(line.len() + data.map_or(0, |d| d.len() + 2));
    request.extend_from_slice(line);
    if let Some(data) = data {
        request.extend_from_slice(data);
        request.extend_from_slice(b"\r\n");
    }

    stream
        .write_all(&request)
        .await
        .map_err(|e| ProtocolError::Io(format!("Failed to write request: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| ProtocolError::Io(format!("Failed to flush request: {}", e)))
}

/// Read one response, including the data block of a VALUE line
async fn read_response<R>(reader: &mut BufReader<R>) -> Result<AsciiResponse, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await.map_err(|e| {
        ProtocolError::Io(format!("Failed to read response line: {}", e))
    })?;

    if bytes_read == 0 {
        return Err(ProtocolError::Io(
            "Server closed connection".to_string(),
        ));
    }

    match AsciiResponse::parse(&line)? {
        AsciiResponse::Value {
            key, flags, bytes, ..
        } => {
            let mut data = vec![0u8; bytes];
            reader.read_exact(&mut data).await.map_err(|e| {
                ProtocolError::Io(format!("Failed to read value data: {}", e))
            })?;

            let mut trailing = [0u8; 2];
            reader.read_exact(&mut trailing).await.map_err(|e| {
                ProtocolError::Io(format!("Failed to read trailing CRLF: {}", e))
            })?;

            Ok(AsciiResponse::Value {
                key,
                flags,
                bytes,
                data,
            })
        }
        response => Ok(response),
    }
}

fn unexpected(response: AsciiResponse) -> ProtocolError {
    match response {
        AsciiResponse::Error(msg)
        | AsciiResponse::ClientError(msg)
        | AsciiResponse::ServerError(msg) => ProtocolError::ServerError(msg),
        other => ProtocolError::ParseError(format!("Unexpected response: {:?}", other)),
    }
}
