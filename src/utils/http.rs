use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

const TRUNCATION_MARKER: &[u8] = b"\n...(truncated)";

/// Reads at most `max_bytes` of an error body. Read failures end the body early
/// instead of failing, since the status already carries the error.
pub async fn read_error_body(response: reqwest::Response, max_bytes: usize) -> Bytes {
    let max_bytes = max_bytes.max(1);
    let mut stream = response.bytes_stream();
    let mut buffered = BytesMut::new();
    while let Some(Ok(chunk)) = stream.next().await {
        let room = max_bytes - buffered.len();
        if chunk.len() > room {
            buffered.extend_from_slice(&chunk[..room]);
            buffered.extend_from_slice(TRUNCATION_MARKER);
            break;
        }
        buffered.extend_from_slice(&chunk);
        if buffered.len() == max_bytes {
            break;
        }
    }
    buffered.freeze()
}

/// Reads a whole response body, failing once it grows past `max_bytes`.
pub async fn read_body_bounded(
    response: reqwest::Response,
    max_bytes: usize,
) -> Result<Bytes, std::io::Error> {
    let max_bytes = max_bytes.max(1);
    if response
        .content_length()
        .is_some_and(|len| len > max_bytes as u64)
    {
        return Err(std::io::Error::other(format!(
            "content-length exceeds max bytes ({max_bytes})"
        )));
    }

    let mut stream = response.bytes_stream();
    let mut buffered = BytesMut::new();
    while let Some(next) = stream.next().await {
        let chunk = next.map_err(std::io::Error::other)?;
        if buffered.len().saturating_add(chunk.len()) > max_bytes {
            return Err(std::io::Error::other(format!(
                "response exceeded max bytes ({max_bytes})"
            )));
        }
        buffered.extend_from_slice(chunk.as_ref());
    }
    Ok(buffered.freeze())
}
