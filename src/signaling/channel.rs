use crate::error::{Result, SessionError};
use crate::signaling::message::SignalingMessage;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Упорядоченный двунаправленный канал к relay.
/// Входящие сообщения читает цикл сессии, исходящие пишутся через `send`.
pub struct SignalingChannel {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: Option<mpsc::UnboundedReceiver<String>>,
    task: Option<JoinHandle<()>>,
}

/// Сторона relay у канала в памяти
pub struct RelayEnd {
    /// Сообщения, отправленные клиентом
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Сообщения для клиента
    pub to_client: mpsc::UnboundedSender<String>,
}

impl SignalingChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound: Some(inbound),
            task,
        }
    }

    /// Канал без сети: обе стороны в одном процессе
    pub fn pair() -> (Self, RelayEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self::new(out_tx, in_rx, None),
            RelayEnd {
                from_client: out_rx,
                to_client: in_tx,
            },
        )
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn send(&self, msg: &SignalingMessage) -> Result<()> {
        let text = msg.encode()?;
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| SessionError::Signaling("channel closed".into()))?;
        tx.send(text)
            .map_err(|_| SessionError::Signaling("relay connection is gone".into()))?;
        debug!("Sent '{}' signaling message", msg.tag());
        Ok(())
    }

    /// Входящий поток отдаётся один раз
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inbound.take()
    }

    pub fn close(&mut self) {
        // закрытие исходящей очереди завершает задачу сокета close-фреймом
        if self.outbound.take().is_some() {
            info!("Closing signaling channel");
        }
        self.inbound = None;
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                tokio::spawn(async move {
                    if tokio::time::timeout(std::time::Duration::from_secs(2), task)
                        .await
                        .is_err()
                    {
                        warn!("Signaling socket did not close in time");
                    }
                });
            }
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Возвращается, когда канал открыт
    async fn open(&self, url: &str) -> Result<SignalingChannel>;
}

/// WebSocket до relay
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<SignalingChannel> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        info!("Connected to the signaling server {url}");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        match outgoing {
                            Some(text) => {
                                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                                    warn!("Signaling send failed: {e}");
                                    break;
                                }
                            }
                            None => {
                                let _ = ws_tx.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    incoming = ws_rx.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                debug!("Signaling message received ({} bytes)", text.len());
                                if in_tx.send(text.as_str().to_owned()).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("Signaling server closed the connection: {:?}", frame);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Signaling socket error: {e}");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("Signaling socket task finished");
        });

        Ok(SignalingChannel::new(out_tx, in_rx, Some(task)))
    }
}
