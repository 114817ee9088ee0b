use anyhow::{Error, anyhow};
use bytes::Bytes;
use reqwest::get as reqwest_get;
use std::path::absolute;
use tokio::fs::read as tokio_fs_read;
use tokio_stream::{Stream, StreamExt as _, once};
use url::Url;

/// Boxed byte stream returned by [`stream_url`].
pub type ByteStream = Box<dyn Stream<Item = Result<Bytes, Error>> + Send + Unpin>;

/// Creates a byte stream from a URL.
///
/// Supported URL schemes:
/// - `http`, `https`: Fetched via `reqwest` as a streaming response
/// - `file`: Read from the local filesystem (emitted as a single chunk)
///
/// # Errors
///
/// - Returns `Err` if the URL scheme is unsupported
/// - Returns `Err` if HTTP fetch fails or returns a non-success status
/// - Returns `Err` if the file path is invalid or the file cannot be read
pub async fn stream_url(url: &Url) -> Result<ByteStream, Error> {
    Ok(match url.scheme() {
        "http" | "https" => {
            let response = reqwest_get(url.clone())
                .await
                .map_err(|err| anyhow!("Failed to fetch URL {url}: {err}"))?;

            if !response.status().is_success() {
                return Err(anyhow!(
                    "Failed to fetch URL: {} (Status: {})",
                    url,
                    response.status()
                ));
            }
            let stream = response.bytes_stream().map(|res| match res {
                Ok(bytes) => Ok::<Bytes, Error>(bytes),
                Err(err) => Err::<Bytes, Error>(anyhow!(err)),
            });
            Box::new(stream)
        }
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|()| anyhow!("Invalid file path for file url: {url}"))?;
            let data = tokio_fs_read(&path)
                .await
                .map(Bytes::from)
                .map_err(|err| anyhow!("Failed to read {}: {err}", path.display()))?;
            Box::new(once(Ok::<Bytes, Error>(data)))
        }
        _ => return Err(anyhow!("Unsupported url scheme {}", url.scheme())),
    })
}

/// Reads a whole resource and returns the number of bytes received.
///
/// # Errors
/// Propagates any error from [`stream_url`] or from a failing chunk.
pub async fn drain_url(url: &Url) -> Result<usize, Error> {
    let mut stream = stream_url(url).await?;
    let mut received = 0;
    while let Some(chunk) = stream.next().await {
        received += chunk?.len();
    }
    Ok(received)
}

/// Reads a whole resource as UTF-8 text.
///
/// # Errors
/// Returns `Err` if the resource cannot be read or is not valid UTF-8.
pub async fn read_text(url: &Url) -> Result<String, Error> {
    let mut stream = stream_url(url).await?;
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    String::from_utf8(buffer).map_err(|err| anyhow!("{url} is not valid UTF-8: {err}"))
}

/// Turns a command line argument into a URL. Anything that does not parse
/// with an `http`, `https` or `file` scheme is treated as a local path.
///
/// # Errors
/// Returns `Err` if the path cannot be made absolute.
pub fn resolve_input(input: &str) -> Result<Url, Error> {
    if let Ok(url) = Url::parse(input)
        && matches!(url.scheme(), "http" | "https" | "file")
    {
        return Ok(url);
    }
    let path = absolute(input)?;
    Url::from_file_path(&path).map_err(|()| anyhow!("Cannot build a file url for {}", path.display()))
}
