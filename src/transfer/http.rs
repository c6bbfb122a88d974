//! HTTP/1.1 framing for the data plane.
//!
//! Just the four methods peers speak, tagged variants instead of a parser
//! hierarchy. Anything the head parser can't place is a network error;
//! what happens *inside* a body is the tar codec's problem.

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Error, Result};

pub const HEADER_REMOTE_TREE: &str = "ZiSync-Remote-Tree-Uuid";
pub const HEADER_LOCAL_TREE: &str = "ZiSync-Local-Tree-Uuid";
pub const HEADER_TOTAL_SIZE: &str = "ZiSync-Total-Size";
pub const HEADER_TOTAL_FILES: &str = "ZiSync-Total-Files";

/// Heads may not exceed this; anything bigger is garbage or malice.
const HEAD_LIMIT: usize = 8 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Method {
    /// Send files; body is a tar stream, manifest first.
    PutTar,
    /// Request files; body is a length-prefixed path list.
    GetTar,
    /// Like PUT, but the sender keeps no metadata of its own.
    Upload,
    /// Fetch the receiver's metadata snapshot.
    GetMeta,
}

impl Method {
    fn request_line(self) -> &'static str {
        match self {
            Method::PutTar => "PUT tar HTTP/1.1",
            Method::GetTar => "GET tar HTTP/1.1",
            Method::Upload => "PUT tar/upload HTTP/1.1",
            Method::GetMeta => "GET meta HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// The receiver's tree uuid.
    pub remote_tree: String,
    /// The sender's tree uuid; absent for pure uploads.
    pub local_tree: Option<String>,
    /// Total body bytes.
    pub total_size: u64,
    pub total_files: u32,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub code: u16,
    /// On a 200 to `GET tar`: the size of the tar body that follows.
    pub total_size: u64,
    pub total_files: u32,
}

impl ResponseHead {
    pub fn ok() -> Self {
        Self {
            code: 200,
            total_size: 0,
            total_files: 0,
        }
    }

    pub fn error(code: u16) -> Self {
        Self {
            code,
            total_size: 0,
            total_files: 0,
        }
    }
}

/// Map a non-200 peer status to the error the task reports.
pub fn status_error(code: u16) -> Error {
    match code {
        400 => Error::network("peer rejected the request as invalid"),
        401 => Error::network("peer doesn't support the request"),
        500 => Error::network("peer internal error"),
        other => Error::network(format!("peer answered {other}")),
    }
}

pub async fn write_request_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &RequestHead,
) -> Result<()> {
    let mut out = String::with_capacity(256);
    out.push_str(head.method.request_line());
    out.push_str("\r\n");
    out.push_str(&format!("{HEADER_REMOTE_TREE}:{}\r\n", head.remote_tree));
    if let Some(local) = &head.local_tree {
        out.push_str(&format!("{HEADER_LOCAL_TREE}:{local}\r\n"));
    }
    out.push_str(&format!("{HEADER_TOTAL_SIZE}:{}\r\n", head.total_size));
    out.push_str(&format!("{HEADER_TOTAL_FILES}:{}\r\n", head.total_files));
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await?;
    Ok(())
}

pub async fn read_request_head<R: AsyncBufReadExt + Unpin>(r: &mut R) -> Result<RequestHead> {
    let (request_line, headers) = read_head(r).await?;

    let method = match request_line.as_str() {
        "PUT tar HTTP/1.1" => Method::PutTar,
        "GET tar HTTP/1.1" => Method::GetTar,
        "PUT tar/upload HTTP/1.1" => Method::Upload,
        "GET meta HTTP/1.1" => Method::GetMeta,
        other => {
            return Err(Error::network(format!("unsupported request {other:?}")));
        }
    };

    let remote_tree = find_header(&headers, HEADER_REMOTE_TREE)
        .ok_or_else(|| Error::network(format!("missing {HEADER_REMOTE_TREE}")))?
        .to_owned();
    let local_tree = find_header(&headers, HEADER_LOCAL_TREE).map(str::to_owned);
    let total_size = parse_decimal(find_header(&headers, HEADER_TOTAL_SIZE).unwrap_or("0"))?;
    let total_files =
        parse_decimal(find_header(&headers, HEADER_TOTAL_FILES).unwrap_or("0"))? as u32;

    Ok(RequestHead {
        method,
        remote_tree,
        local_tree,
        total_size,
        total_files,
    })
}

pub async fn write_response_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &ResponseHead,
) -> Result<()> {
    let status = match head.code {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unsupported",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut out = String::with_capacity(128);
    out.push_str(status);
    out.push_str("\r\n");
    if head.code == 200 {
        out.push_str(&format!("{HEADER_TOTAL_SIZE}:{}\r\n", head.total_size));
        out.push_str(&format!("{HEADER_TOTAL_FILES}:{}\r\n", head.total_files));
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_response_head<R: AsyncBufReadExt + Unpin>(r: &mut R) -> Result<ResponseHead> {
    let (status_line, headers) = read_head(r).await?;

    let code = status_line
        .strip_prefix("HTTP/1.1 ")
        .and_then(|rest| rest.split(' ').next())
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::network(format!("undecipherable status line {status_line:?}")))?;

    let total_size = parse_decimal(find_header(&headers, HEADER_TOTAL_SIZE).unwrap_or("0"))?;
    let total_files =
        parse_decimal(find_header(&headers, HEADER_TOTAL_FILES).unwrap_or("0"))? as u32;

    Ok(ResponseHead {
        code,
        total_size,
        total_files,
    })
}

/// Read the first line and the header lines up to the blank separator.
async fn read_head<R: AsyncBufReadExt + Unpin>(r: &mut R) -> Result<(String, Vec<(String, String)>)> {
    let mut first = None;
    let mut headers = Vec::new();
    let mut total = 0;

    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::network("peer closed mid-head"));
        }
        total += n;
        if total > HEAD_LIMIT {
            return Err(Error::network("head too large"));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            match first {
                Some(first) => return Ok((first, headers)),
                // Tolerate leading blank lines like every server since 1996.
                None => continue,
            }
        }
        if first.is_none() {
            first = Some(line.to_owned());
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        } else {
            return Err(Error::network(format!("header line without a colon: {line:?}")));
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_decimal(s: &str) -> Result<u64> {
    s.parse()
        .map_err(|e| Error::network(format!("bad decimal header value {s:?}: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn request_head_round_trips() {
        let head = RequestHead {
            method: Method::PutTar,
            remote_tree: "remote-uuid".into(),
            local_tree: Some("local-uuid".into()),
            total_size: 12345,
            total_files: 7,
        };
        let mut wire = Vec::new();
        write_request_head(&mut wire, &head).await.unwrap();

        let mut reader = BufReader::new(wire.as_slice());
        let back = read_request_head(&mut reader).await.unwrap();
        assert_eq!(back.method, Method::PutTar);
        assert_eq!(back.remote_tree, "remote-uuid");
        assert_eq!(back.local_tree.as_deref(), Some("local-uuid"));
        assert_eq!(back.total_size, 12345);
        assert_eq!(back.total_files, 7);
    }

    #[tokio::test]
    async fn upload_heads_need_no_local_tree() {
        let head = RequestHead {
            method: Method::Upload,
            remote_tree: "r".into(),
            local_tree: None,
            total_size: 0,
            total_files: 0,
        };
        let mut wire = Vec::new();
        write_request_head(&mut wire, &head).await.unwrap();
        let back = read_request_head(&mut BufReader::new(wire.as_slice()))
            .await
            .unwrap();
        assert_eq!(back.method, Method::Upload);
        assert_eq!(back.local_tree, None);
    }

    #[tokio::test]
    async fn unknown_methods_are_network_errors() {
        let wire = b"DELETE everything HTTP/1.1\r\n\r\n";
        let err = read_request_head(&mut BufReader::new(wire.as_slice()))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "network");
    }

    #[tokio::test]
    async fn response_heads_round_trip() {
        let mut wire = Vec::new();
        write_response_head(
            &mut wire,
            &ResponseHead {
                code: 200,
                total_size: 99,
                total_files: 2,
            },
        )
        .await
        .unwrap();
        let back = read_response_head(&mut BufReader::new(wire.as_slice()))
            .await
            .unwrap();
        assert_eq!(back.code, 200);
        assert_eq!(back.total_size, 99);

        let mut wire = Vec::new();
        write_response_head(&mut wire, &ResponseHead::error(401))
            .await
            .unwrap();
        let back = read_response_head(&mut BufReader::new(wire.as_slice()))
            .await
            .unwrap();
        assert_eq!(back.code, 401);
        assert_eq!(status_error(back.code).category(), "network");
    }

    #[tokio::test]
    async fn truncated_heads_fail_cleanly() {
        let wire = b"PUT tar HTTP/1.1\r\nZiSync-Remote";
        let err = read_request_head(&mut BufReader::new(wire.as_slice()))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "network");
    }
}
