//! WebSocket to stdio proxy used as the ssh `ProxyCommand`.
//!
//! Bytes read from stdin are sent as binary frames; every frame received is
//! written to stdout. The proxy exits when the socket closes or stdin ends
//! and the server finishes the close handshake.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const READ_CHUNK: usize = 16 * 1024;

/// Proxies the process's stdin/stdout through the WebSocket at `url`.
pub(crate) async fn run(url: &str) -> Result<()> {
    pump(url, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Connects to `url` and copies `input` to the socket and the socket to `output`.
pub(crate) async fn pump<R, W>(url: &str, mut input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    // rustls needs a process-wide provider; a second install is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut request = url
        .into_client_request()
        .with_context(|| format!("Invalid WebSocket URL: {url}"))?;
    // websockify serves raw bytes under the "binary" subprotocol.
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("binary"));

    let (stream, _) = connect_async(request)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    debug!("Connected to {}", url);
    let (mut sink, mut source) = stream.split();

    let upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = input.read(&mut buf).await.context("Failed to read stdin")?;
            if n == 0 {
                break;
            }
            sink.send(Message::Binary(buf[..n].to_vec()))
                .await
                .context("Failed to send frame")?;
        }
        sink.close().await.context("Failed to close WebSocket")?;
        Ok::<_, anyhow::Error>(())
    });

    let downstream = async {
        while let Some(message) = source.next().await {
            let data = match message.context("WebSocket receive failed")? {
                Message::Binary(data) => data,
                Message::Text(text) => text.into_bytes(),
                Message::Close(_) => break,
                _ => continue,
            };
            output.write_all(&data).await.context("Failed to write stdout")?;
            output.flush().await.context("Failed to flush stdout")?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let result = downstream.await;
    upstream.abort();
    result
}
