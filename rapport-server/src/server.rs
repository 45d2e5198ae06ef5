use crate::engine::Engine;
use crate::router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rapport_core::ipc::{self, RapportRequest, RapportResponse};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// 4-byte little-endian length prefix + MessagePack payload
fn le_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().little_endian().new_codec()
}

pub async fn run_unix_server(
    socket_path: &str,
    engine: Arc<Engine>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("IPC Server listening on {}", socket_path);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _) = res?;
                let engine = engine.clone();
                tokio::spawn(async move {
                    serve_connection(stream, engine).await;
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("Shutting down IPC server...");
                break;
            }
        }
    }

    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

async fn serve_connection(stream: UnixStream, engine: Arc<Engine>) {
    let (read, write) = stream.into_split();
    let mut framed_read = FramedRead::new(read, le_codec());
    let mut framed_write = FramedWrite::new(write, le_codec());

    while let Some(frame) = framed_read.next().await {
        let bytes_mut = match frame {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
        };

        let response = match ipc::decode_frame::<RapportRequest>(&bytes_mut) {
            Ok(request) => router::handle_request(request, &engine).await,
            Err(e) => RapportResponse::err(format!("Deserialization error: {}", e)),
        };

        match ipc::encode_frame(&response) {
            Ok(resp_bytes) => {
                if let Err(e) = framed_write.send(Bytes::from(resp_bytes)).await {
                    tracing::error!("Failed to send response: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_core::store::MemoryStore;
    use rapport_core::RapportConfig;

    // ========================================================================
    // TEST 1: request/response over a real socket, garbage frame survives
    // ========================================================================
    #[tokio::test]
    async fn test_socket_roundtrip() {
        let dir = std::env::temp_dir().join(format!("rapport-ipc-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket = dir.join("rapport.sock");
        let socket_path = socket.to_str().unwrap().to_string();

        let engine = Arc::new(Engine::new(
            Arc::new(MemoryStore::new()),
            RapportConfig::default(),
        ));
        let (tx, _rx) = broadcast::channel(1);
        let server = tokio::spawn({
            let path = socket_path.clone();
            let shutdown = tx.subscribe();
            async move { run_unix_server(&path, engine, shutdown).await }
        });

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = UnixStream::connect(&socket_path).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let (read, write) = stream.expect("server socket").into_split();
        let mut rx = FramedRead::new(read, le_codec());
        let mut tx_frames = FramedWrite::new(write, le_codec());

        tx_frames
            .send(Bytes::from(vec![0xc1, 0x00]))
            .await
            .unwrap();
        let resp: RapportResponse = ipc::decode_frame(&rx.next().await.unwrap().unwrap()).unwrap();
        assert!(!resp.is_ok());

        let ping = ipc::encode_frame(&RapportRequest::Ping).unwrap();
        tx_frames.send(Bytes::from(ping)).await.unwrap();
        let resp: RapportResponse = ipc::decode_frame(&rx.next().await.unwrap().unwrap()).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.data.unwrap()["pong"], true);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
