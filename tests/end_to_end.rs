#[cfg(test)]
mod tests {
    use courier::protocol::body::{from_body, to_body, DownloadMeta, DownloadRequest, FileEvent, FileSaved};
    use courier::protocol::{read_frame, write_frame};
    use courier::{
        Client, ClientConfig, ClientEvent, Frame, FrameKind, MemoryStore, OutboundTransfer,
        Server, ServerConfig, Store,
    };
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    async fn start_server(temp: &TempDir) -> anyhow::Result<SocketAddr> {
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            storage_dir: temp.path().join("server"),
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(temp.path().join("server/blobs")));
        store.register_user("alice", "pw-a").await?;
        store.register_user("bob", "pw-b").await?;

        let server = Server::bind(config, store).await?;
        let addr = server.local_addr()?;
        tokio::spawn(server.run());
        Ok(addr)
    }

    async fn expect_frame(stream: &mut TcpStream) -> anyhow::Result<Frame> {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
            .await??
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        Ok(frame)
    }

    async fn raw_login(addr: SocketAddr, user: &str, password: &str) -> anyhow::Result<TcpStream> {
        let mut stream = TcpStream::connect(addr).await?;
        let login = Frame::new(FrameKind::Login)
            .with_sender(user)
            .with_body(password)
            .with_transfer_id("login-1");
        write_frame(&mut stream, &login).await?;
        let ack = expect_frame(&mut stream).await?;
        assert_eq!(ack.kind, FrameKind::Ack);
        assert_eq!(ack.transfer_id, "login-1");
        assert_eq!(ack.body, "OK LOGIN");
        Ok(stream)
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            ack_timeout_ms: 5_000,
            retry_backoff_ms: 50,
            ..Default::default()
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_upload_then_download_over_tcp() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let addr = start_server(&temp).await?;
        let mut stream = raw_login(addr, "alice", "pw-a").await?;

        let meta = r#"{"to":"bob","name":"a.bin","mime":"application/octet-stream","size":3}"#;
        write_frame(
            &mut stream,
            &Frame::new(FrameKind::FileMeta)
                .with_sender("alice")
                .with_recipient("bob")
                .with_body(meta)
                .with_transfer_id("f1"),
        )
        .await?;
        write_frame(
            &mut stream,
            &Frame::new(FrameKind::FileChunk)
                .with_sender("alice")
                .with_recipient("bob")
                .with_transfer_id("f1")
                .with_seq(0)
                .with_last(true)
                .with_bin(vec![1u8, 2, 3]),
        )
        .await?;

        let ack = expect_frame(&mut stream).await?;
        assert_eq!(ack.kind, FrameKind::Ack);
        assert_eq!(ack.transfer_id, "f1");
        let saved: FileSaved = from_body(&ack.body)?;
        assert_eq!(saved.status, "FILE_SAVED");
        assert_eq!(saved.bytes, 3);

        write_frame(
            &mut stream,
            &Frame::new(FrameKind::DownloadFile)
                .with_sender("alice")
                .with_transfer_id(saved.file_id.to_string())
                .with_body(to_body(&DownloadRequest::by_file(saved.file_id))?),
        )
        .await?;

        let meta = expect_frame(&mut stream).await?;
        assert_eq!(meta.kind, FrameKind::FileMeta);
        let info: DownloadMeta = from_body(&meta.body)?;
        assert_eq!(info.file_id, saved.file_id);
        assert_eq!(info.name, "a.bin");
        assert_eq!(info.bytes, 3);

        let chunk = expect_frame(&mut stream).await?;
        assert_eq!(chunk.kind, FrameKind::FileChunk);
        assert_eq!(chunk.seq, 0);
        assert!(chunk.last);
        assert_eq!(chunk.bin.as_deref(), Some(&[1u8, 2, 3][..]));

        Ok(())
    }

    #[tokio::test]
    async fn test_client_upload_event_and_download() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let addr = start_server(&temp).await?;

        let (mut alice, _alice_events) = Client::connect(addr, client_config()).await?;
        alice.login("alice", "pw-a").await?;
        let (mut bob, mut bob_events) = Client::connect(addr, client_config()).await?;
        bob.login("bob", "pw-b").await?;

        let source = temp.path().join("photo.jpg");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &payload)?;

        let transfer = OutboundTransfer::file("bob", &source)
            .with_mime("image/jpeg")
            .with_reply_to(1);
        let saved = alice.send_with_ack(&transfer).await?;
        assert_eq!(saved.bytes, payload.len() as u64);

        let announced = match next_event(&mut bob_events).await {
            ClientEvent::Incoming(frame) if frame.kind == FrameKind::FileEvt => {
                from_body::<FileEvent>(&frame.body)?
            }
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(announced.file_id, saved.file_id);
        assert_eq!(announced.from, "alice");
        assert_eq!(announced.reply_to, Some(1));

        let dest = temp.path().join("downloads");
        assert!(bob.request_download(announced.file_id, &dest).await?);
        match next_event(&mut bob_events).await {
            ClientEvent::DownloadFinished { path, bytes, .. } => {
                assert_eq!(bytes, payload.len() as u64);
                assert_eq!(path, dest.join("photo.jpg"));
                assert_eq!(std::fs::read(path)?, payload);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_offline_dm_is_delivered_on_login() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let addr = start_server(&temp).await?;

        let (mut alice, mut alice_events) = Client::connect(addr, client_config()).await?;
        alice.login("alice", "pw-a").await?;
        alice.send_dm("bob", "are you there?", Some(42)).await?;
        let id = match next_event(&mut alice_events).await {
            ClientEvent::Ack(ack) => {
                assert_eq!(ack.body, "OK QUEUED");
                ack.transfer_id
            }
            other => panic!("unexpected event: {other:?}"),
        };

        let (mut bob, mut bob_events) = Client::connect(addr, client_config()).await?;
        bob.login("bob", "pw-b").await?;
        match next_event(&mut bob_events).await {
            ClientEvent::Incoming(frame) => {
                assert_eq!(frame.kind, FrameKind::Dm);
                assert_eq!(frame.sender, "alice");
                assert_eq!(frame.transfer_id, id);
                assert_eq!(frame.body, "[REPLY:42]are you there?");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(bob.history("alice", 0).await?, 1);
        match next_event(&mut bob_events).await {
            ClientEvent::Incoming(frame) => {
                assert_eq!(frame.kind, FrameKind::History);
                assert_eq!(frame.body, "[REPLY:42][HIST IN] alice: are you there?");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_bad_credentials_are_rejected() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let addr = start_server(&temp).await?;

        let (mut client, _events) = Client::connect(addr, client_config()).await?;
        let err = client.login("alice", "nope").await.unwrap_err();
        assert!(matches!(err, courier::Error::Rejected(_)), "{err}");
        assert!(client.user().is_none());

        // The connection is still usable.
        client.login("alice", "pw-a").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let addr = start_server(&temp).await?;
        let mut stream = TcpStream::connect(addr).await?;

        // length 0, kind 0xEE
        stream.write_all(&[0, 0, 0, 0, 0xEE]).await?;

        let err = expect_frame(&mut stream).await?;
        assert_eq!(err.kind, FrameKind::Error);
        assert!(err.body.contains("unknown frame kind"));
        let eof = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream)).await??;
        assert!(eof.is_none());
        Ok(())
    }
}
