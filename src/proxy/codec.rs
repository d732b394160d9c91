//! HTTP/1.x request-head reader for decrypted tunnel streams

use hyper::http::request::Parts;
use hyper::{Method, Request, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::{Error, Result};

/// Upper bound on request line plus headers
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Read one request line and its headers.
///
/// Returns `Ok(None)` when the peer closes before sending anything. Any
/// request body stays unread in `reader`.
pub async fn read_request_head<S>(reader: &mut BufReader<S>, max_bytes: usize) -> Result<Option<Parts>>
where
    S: AsyncRead + Unpin,
{
    let mut budget = max_bytes;
    let Some(request_line) = read_line(reader, &mut budget).await? else {
        return Ok(None);
    };

    let mut fields = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::proxy(format!("Malformed request line '{}'", request_line)));
    };

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(Error::proxy(format!("Unsupported HTTP version '{}'", other))),
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::proxy(format!("Invalid method '{}'", method)))?;

    let mut builder = Request::builder().method(method).uri(target).version(version);
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| Error::proxy("Connection closed inside request headers"))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::proxy(format!("Malformed header line '{}'", line)))?;
        if name.is_empty() || name.ends_with(char::is_whitespace) {
            return Err(Error::proxy(format!("Malformed header name '{}'", name)));
        }
        builder = builder.header(name, value.trim());
    }

    let request = builder
        .body(())
        .map_err(|e| Error::proxy(format!("Invalid request head: {}", e)))?;
    Ok(Some(request.into_parts().0))
}

/// One CRLF- or LF-terminated line, without the terminator. `None` on EOF
/// before the first byte.
async fn read_line<S>(reader: &mut BufReader<S>, budget: &mut usize) -> Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(Error::proxy("Connection closed mid-line"));
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let take = newline.map_or(available.len(), |idx| idx + 1);
        if take > *budget {
            return Err(Error::proxy("Request head too large"));
        }
        line.extend_from_slice(&available[..take]);
        reader.consume(take);
        *budget -= take;

        if newline.is_some() {
            break;
        }
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| Error::proxy("Request head is not valid UTF-8"))
}
