//! Embedded HTTP server exposing local files to the cast device.
//!
//! Cast receivers fetch media over plain HTTP and rely on byte ranges for
//! seeking, so single-range requests are honoured; multipart ranges are
//! answered with the full body like any server that does not support them.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::Response,
    Router,
};
use crate::util::named;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::{io::ReaderStream, sync::CancellationToken};

/// One local file pinned to a fixed URL path.
#[derive(Clone, Debug)]
pub struct ServedFile {
    pub route: &'static str,
    pub path: PathBuf,
    pub content_type: String,
}

/// A running file server bound to an OS-assigned (or requested) port.
pub struct FileServer {
    local_addr: SocketAddr,
    join_handle: tokio::task::JoinHandle<()>,
}

struct ServerState {
    files: Vec<ServedFile>,
}

impl FileServer {
    /// Binds and starts serving. The returned server is already
    /// listening, so `local_addr` is safe to hand to the device.
    #[named]
    pub async fn start(bind: SocketAddr,
                       files: Vec<ServedFile>,
                       cancel: CancellationToken)
    -> crate::Result<FileServer>
    {
        const METHOD_PATH: &str = method_path!("FileServer");

        let listener = tokio::net::TcpListener::bind(bind).await
            .map_err(|err| anyhow::format_err!(
                "failed to bind file server to {bind}: {err}"))?;

        let local_addr = listener.local_addr()
            .map_err(|err| anyhow::format_err!(
                "failed to read file server local addr: {err}"))?;

        tracing::info!(target: METHOD_PATH,
                       %local_addr,
                       routes = ?files.iter().map(|f| f.route).collect::<Vec<_>>(),
                       "file server listening");

        let state = Arc::new(ServerState { files });

        let app = Router::new()
            .fallback(serve_file)
            .with_state(state);

        let join_handle = tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;

            if let Err(err) = res {
                tracing::error!(target: METHOD_PATH,
                                ?err,
                                "file server exited with error");
            } else {
                tracing::debug!(target: METHOD_PATH,
                                "file server stopped");
            }
        });

        Ok(FileServer {
            local_addr,
            join_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the serve loop to finish after its cancellation token
    /// fired.
    pub async fn join(self) {
        if let Err(err) = self.join_handle.await {
            tracing::warn!(?err, "FileServer::join: serve task panicked");
        }
    }
}

/// What a `Range` header asks for, relative to a body of `size` bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RangeOutcome {
    /// No range, or one this server ignores. Send the whole body.
    Full,

    /// Inclusive byte range.
    Partial { start: u64, end: u64 },

    /// A syntactically valid range outside the body.
    Unsatisfiable,
}

/// Interprets a single `bytes=` range against a known body size.
///
/// Multi-range and malformed headers degrade to a full response rather
/// than an error.
fn parse_range(header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };

    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };

    if spec.contains(',') {
        return RangeOutcome::Full;
    }

    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    let start = match start_str.trim() {
        "" => None,
        s => match s.parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => return RangeOutcome::Full,
        },
    };
    let end = match end_str.trim() {
        "" => None,
        s => match s.parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => return RangeOutcome::Full,
        },
    };

    match (start, end) {
        (None, None) => RangeOutcome::Full,

        // Suffix range: the last `n` bytes.
        (None, Some(n)) => {
            if n == 0 || size == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            let len = n.min(size);
            RangeOutcome::Partial { start: size - len, end: size - 1 }
        },

        (Some(start), None) => {
            if start >= size {
                return RangeOutcome::Unsatisfiable;
            }
            RangeOutcome::Partial { start, end: size - 1 }
        },

        (Some(start), Some(end)) => {
            if start > end || start >= size {
                return RangeOutcome::Unsatisfiable;
            }
            RangeOutcome::Partial { start, end: end.min(size - 1) }
        },
    }
}

#[named]
async fn serve_file(State(state): State<Arc<ServerState>>, req: Request) -> Response {
    const FUNCTION_PATH: &str = function_path!();

    let path = req.uri().path();
    let method = req.method().clone();

    let Some(file) = state.files.iter().find(|f| f.route == path) else {
        tracing::debug!(target: FUNCTION_PATH,
                        path,
                        "request for unknown path");
        return status_response(StatusCode::NOT_FOUND);
    };

    if method != Method::GET && method != Method::HEAD {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let size = match tokio::fs::metadata(&file.path).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            tracing::warn!(target: FUNCTION_PATH,
                           ?err,
                           path = %file.path.display(),
                           "served file no longer readable");
            return status_response(StatusCode::NOT_FOUND);
        },
    };

    let range_header = req.headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let range = parse_range(range_header, size);

    tracing::debug!(target: FUNCTION_PATH,
                    %method,
                    path,
                    range_header,
                    ?range,
                    size,
                    "file request");

    let (status, start, len) = match range {
        RangeOutcome::Unsatisfiable => {
            return base_headers(Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE))
                .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                .body(Body::empty())
                .unwrap_or_else(|_| status_response(StatusCode::RANGE_NOT_SATISFIABLE));
        },

        RangeOutcome::Full => (StatusCode::OK, 0, size),

        RangeOutcome::Partial { start, end } =>
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
    };

    let mut builder = base_headers(Response::builder().status(status))
        .header(header::CONTENT_TYPE, file.content_type.as_str())
        .header(header::CONTENT_LENGTH, len);

    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{size}", end = start + len - 1));
    }

    if method == Method::HEAD {
        return builder.body(Body::empty())
            .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR));
    }

    let mut fh = match tokio::fs::File::open(&file.path).await {
        Ok(fh) => fh,
        Err(err) => {
            tracing::warn!(target: FUNCTION_PATH,
                           ?err,
                           path = %file.path.display(),
                           "failed to open served file");
            return status_response(StatusCode::NOT_FOUND);
        },
    };

    if start > 0 {
        if let Err(err) = fh.seek(std::io::SeekFrom::Start(start)).await {
            tracing::warn!(target: FUNCTION_PATH,
                           ?err,
                           start,
                           path = %file.path.display(),
                           "seek failed");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let body = Body::from_stream(ReaderStream::new(fh.take(len)));

    builder.body(body)
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn base_headers(builder: axum::http::response::Builder) -> axum::http::response::Builder {
    builder
        .header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"))
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))
}

fn status_response(status: StatusCode) -> Response {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_header_is_full() {
        assert_eq!(parse_range(None, 100), RangeOutcome::Full);
    }

    #[test]
    fn open_ended_range() {
        assert_eq!(parse_range(Some("bytes=10-"), 100),
                   RangeOutcome::Partial { start: 10, end: 99 });
    }

    #[test]
    fn bounded_range_clamps_to_size() {
        assert_eq!(parse_range(Some("bytes=0-49"), 100),
                   RangeOutcome::Partial { start: 0, end: 49 });

        assert_eq!(parse_range(Some("bytes=50-500"), 100),
                   RangeOutcome::Partial { start: 50, end: 99 });
    }

    #[test]
    fn suffix_range_takes_last_bytes() {
        assert_eq!(parse_range(Some("bytes=-20"), 100),
                   RangeOutcome::Partial { start: 80, end: 99 });

        // Longer than the body: the whole body, as a partial response.
        assert_eq!(parse_range(Some("bytes=-500"), 100),
                   RangeOutcome::Partial { start: 0, end: 99 });
    }

    #[test]
    fn out_of_bounds_start_is_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=100-"), 100),
                   RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=200-300"), 100),
                   RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=30-10"), 100),
                   RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-0"), 100),
                   RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn malformed_or_multi_ranges_fall_back_to_full() {
        assert_eq!(parse_range(Some("bytes=abc-"), 100), RangeOutcome::Full);
        assert_eq!(parse_range(Some("items=0-10"), 100), RangeOutcome::Full);
        assert_eq!(parse_range(Some("bytes=0-10,20-30"), 100), RangeOutcome::Full);
        assert_eq!(parse_range(Some("bytes=-"), 100), RangeOutcome::Full);
    }
}
