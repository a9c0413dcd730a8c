//! UNIX-domain-socket (TCP-loopback-fallback) TLV ingestion (§4.11).
//!
//! One connection per accepted client, `TlvDecoder` fed straight off the
//! read buffer the same restartable way `tlv.rs`'s own doctest loop feeds
//! it, and each packet's `type` resolved against a small configured
//! `type → {name, outputs[]}` table rather than a fixed enum, since unlike
//! the TLV wire's 4-value type vocabulary (§4.3) the *mapping* from wire
//! type to named metric route is deployment config, not a protocol
//! constant.
//!
//! Like `ingress_http.rs`, connections are accepted and read directly off
//! `tokio::net`'s own reactor rather than through `crate::event_loop` —
//! see Open Question decision #3 in `SPEC_FULL.md` for why EventLoop is
//! scoped to the raw ICMP probe socket instead.

use crate::channel::ChannelManager;
use crate::net_endpoint::listen_unix;
use crate::tlv::TlvDecoder;
use shared::config::Output;
use shared::metrics::{Metric, MetricValue};
use shared::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// One configured receive item: the name a TLV `type` maps to, and the
/// sinks its decoded metric fans out to.
#[derive(Debug, Clone)]
pub struct ReceiveItem {
    pub name: String,
    pub outputs: Vec<Output>,
}

pub struct DomainIngress {
    channel: Arc<ChannelManager>,
    receive_items: Arc<HashMap<u16, ReceiveItem>>,
}

impl DomainIngress {
    pub fn new(channel: Arc<ChannelManager>, receive_items: HashMap<u16, ReceiveItem>) -> Self {
        Self {
            channel,
            receive_items: Arc::new(receive_items),
        }
    }

    #[cfg(unix)]
    pub async fn run(&self, socket_path: &std::path::Path, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = listen_unix(socket_path)?;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    self.spawn_reader(stream);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
        Ok(())
    }

    /// Platforms without UNIX sockets fall back to a TCP loopback listener
    /// carrying the identical TLV stream (§4.11).
    #[cfg(not(unix))]
    pub async fn run(&self, bind: std::net::SocketAddr, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(bind).await?;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    self.spawn_reader(stream);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
        Ok(())
    }

    fn spawn_reader<S>(&self, stream: S)
    where
        S: AsyncReadExt + Unpin + Send + 'static,
    {
        let channel = self.channel.clone();
        let receive_items = self.receive_items.clone();
        tokio::spawn(async move {
            if let Err(e) = read_tlv_stream(stream, &channel, &receive_items).await {
                debug!(error = %e, "domain ingress connection ended");
            }
        });
    }
}

async fn read_tlv_stream<S>(
    mut stream: S,
    channel: &ChannelManager,
    receive_items: &HashMap<u16, ReceiveItem>,
) -> anyhow::Result<()>
where
    S: AsyncReadExt + Unpin,
{
    let mut decoder = TlvDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut offset = 0;
        while offset < n {
            let (consumed, packet) = decoder.decode_one(&buf[offset..n])?;
            offset += consumed;
            let Some(packet) = packet else { continue };

            match receive_items.get(&packet.packet_type) {
                Some(item) => {
                    let metric = decode_metric(&item.name, &packet.value);
                    let _ = channel.send(vec![metric], &item.outputs).await;
                }
                None => {
                    warn!(packet_type = packet.packet_type, "unknown TLV receive type, dropping");
                }
            }
        }
    }
}

fn decode_metric(name: &str, body: &[u8]) -> Metric {
    let now = current_timestamp();
    match std::str::from_utf8(body).ok().and_then(|s| s.trim().parse::<f64>().ok()) {
        Some(value) => Metric::gauge(name.to_string(), value, now),
        None => Metric {
            name: name.to_string(),
            labels: Default::default(),
            value: MetricValue::Text(String::from_utf8_lossy(body).into_owned()),
            timestamp: now,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OverflowPolicy;
    use std::time::Duration;

    #[tokio::test]
    async fn unknown_type_is_dropped_without_error() {
        let channel = Arc::new(ChannelManager::new(10, Duration::from_secs(3600)));
        channel.start();
        let items: HashMap<u16, ReceiveItem> = HashMap::new();

        let packet = crate::tlv::TlvPacket::new(9, b"1.0".to_vec());
        let encoded = packet.encode().unwrap();

        #[cfg(unix)]
        {
            let (mut a, b) = tokio::net::UnixStream::pair().unwrap();
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                a.write_all(&encoded).await.unwrap();
            });
            read_tlv_stream(b, &channel, &items).await.ok();
        }
    }

    #[test]
    fn decode_metric_parses_numeric_body_as_gauge() {
        let metric = decode_metric("cpu", b"42.5");
        assert_eq!(metric.value, MetricValue::Gauge(42.5));
    }

    #[test]
    fn decode_metric_falls_back_to_text_for_non_numeric_body() {
        let metric = decode_metric("note", b"hello");
        assert_eq!(metric.value, MetricValue::Text("hello".to_string()));
    }

    #[tokio::test]
    async fn receive_item_routes_to_configured_outputs() {
        let channel = Arc::new(ChannelManager::new(10, Duration::from_secs(3600)));
        channel.start();
        channel
            .register("sink-a", Arc::new(NullSink), OverflowPolicy::DropNewest)
            .await
            .unwrap();
        let mut items = HashMap::new();
        items.insert(
            1,
            ReceiveItem {
                name: "remote.cpu".to_string(),
                outputs: vec![("sink-a".to_string(), serde_json::json!({}))],
            },
        );

        let packet = crate::tlv::TlvPacket::new(1, b"10".to_vec());
        let encoded = packet.encode().unwrap();

        #[cfg(unix)]
        {
            let (mut a, b) = tokio::net::UnixStream::pair().unwrap();
            use tokio::io::AsyncWriteExt;
            tokio::spawn(async move {
                a.write_all(&encoded).await.unwrap();
            });
            read_tlv_stream(b, &channel, &items).await.ok();
        }
    }

    struct NullSink;
    #[async_trait::async_trait]
    impl crate::channel::SinkWriter for NullSink {
        async fn write(&self, _metrics: &[Metric]) -> shared::Result<()> {
            Ok(())
        }
    }
}
