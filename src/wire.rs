//! Text encoding of control-channel requests and responses.

use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::RtspError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Setup,
    Play,
    Pause,
    Teardown,
}

impl Method {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
        }
    }
}

/// Render a request as its wire text. SETUP carries the client's RTP port in
///  a `Transport` header instead of a session id; all other methods carry the
///  session id the server issued at SETUP.
pub fn encode_request(
    method: Method,
    target: &str,
    cseq: u32,
    session_id: Option<&str>,
    client_port: Option<u16>,
) -> String {
    let mut request = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method.as_wire(), target, cseq);
    if let Some(session_id) = session_id {
        request.push_str(&format!("Session: {}\r\n", session_id));
    }
    if let Some(client_port) = client_port {
        request.push_str(&format!("Transport: RTP/UDP; client_port= {}\r\n", client_port));
    }
    request.push_str("\r\n");
    request
}

/// A parsed control-channel response: status line plus headers, read up to and
///  including the terminating blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub version: String,
    pub code: u16,
    pub message: String,
    headers: FxHashMap<String, String>,
}

impl RtspResponse {
    /// Read one response off the control channel. A status line that does not
    ///  parse is reported as a protocol error rather than hiding whatever text
    ///  the server actually sent.
    pub async fn read_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RtspResponse, RtspError> {
        let status_line = read_line(reader).await?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or("").to_string();
        let code = parts.next().and_then(|c| c.parse::<u16>().ok());
        let message = parts.next().unwrap_or("").to_string();

        let code = match code {
            Some(code) if version.starts_with("RTSP/") => code,
            _ => {
                return Err(RtspError::Protocol {
                    code: 0,
                    message: format!("malformed status line {:?}", status_line),
                });
            }
        };

        let mut headers = FxHashMap::default();
        loop {
            let line = read_line(reader).await?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_string());
            }
        }

        Ok(RtspResponse {
            version,
            code,
            message,
            headers,
        })
    }

    /// Header lookup by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    /// Turn any non-200 status into an error so callers can chain on success.
    pub fn ensure_ok(self) -> Result<RtspResponse, RtspError> {
        if self.code == 200 {
            Ok(self)
        }
        else {
            Err(RtspError::Protocol {
                code: self.code,
                message: self.message,
            })
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, RtspError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "control channel closed",
        )
        .into());
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}
