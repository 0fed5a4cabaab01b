//! Live block feed over a websocket.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, trace, warn};
use url::Url;

use crate::{
    error::{IndexerError, IndexerResult},
    models::Block,
    source::{BlockStream, RetryConfig},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FEED_BUFFER: usize = 256;

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedMessage {
    Block(Block),
    Envelope { data: Block },
    Other(serde_json::Value),
}

/// Decodes a text frame; frames that are not blocks (heartbeats, acks) yield `None`.
pub fn parse_feed_message(text: &str) -> IndexerResult<Option<Block>> {
    Ok(match serde_json::from_str::<FeedMessage>(text)? {
        FeedMessage::Block(block) | FeedMessage::Envelope { data: block } => Some(block),
        FeedMessage::Other(frame) => {
            trace!(%frame, "ignoring non-block live feed frame");
            None
        }
    })
}

/// Connects to the feed and forwards blocks until the connection ends.
pub async fn subscribe(url: &Url, retry: &RetryConfig) -> IndexerResult<BlockStream> {
    let (stream, _) = retry
        .retry("live feed connect", || async move {
            connect_async(url.as_str())
                .await
                .map_err(IndexerError::from)
        })
        .await?;
    info!("subscribed to live feed at {}", url);

    let (tx, rx) = mpsc::channel(FEED_BUFFER);
    tokio::spawn(forward_blocks(stream, tx));
    Ok(rx)
}

async fn forward_blocks(mut stream: WsStream, tx: mpsc::Sender<Block>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match parse_feed_message(text.as_str()) {
                Ok(Some(block)) => {
                    if tx.send(block).await.is_err() {
                        // subscriber went away
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("dropping undecodable live feed message: {e}"),
            },
            Ok(Message::Close(frame)) => {
                info!(?frame, "live feed closed by server");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("live feed error: {e}");
                return;
            }
        }
    }
}
