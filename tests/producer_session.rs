//! Integration test exercising `Producer` against a loopback broker that
//! negotiates identity and answers one `PUB` with `OK`, verifying the
//! promise-before-send response matching actually resolves the caller's
//! `publish` future with the body the broker observed.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use nsq_client::{Producer, ProducerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const FRAME_TYPE_RESPONSE: i32 = 0;

fn frame(frame_type: i32, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(4 + payload.len());
    body.put_i32(frame_type);
    body.put_slice(payload);
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_i32(body.len() as i32);
    out.extend_from_slice(&body);
    out
}

async fn read_line(socket: &mut TcpStream) -> String {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        socket.read_exact(&mut byte).await.expect("read command byte");
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).expect("command is utf8")
}

async fn read_body(socket: &mut TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await.expect("read body length");
    let len = BigEndian::read_i32(&len_buf) as usize;
    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await.expect("read body");
    body
}

async fn run_mock_broker(listener: TcpListener, pub_body_tx: oneshot::Sender<Vec<u8>>) {
    let (mut socket, _) = listener.accept().await.expect("accept");

    let mut magic = [0u8; 4];
    socket.read_exact(&mut magic).await.expect("read magic");
    assert_eq!(&magic, b"  V2");

    let identify_line = read_line(&mut socket).await;
    assert!(identify_line.starts_with("IDENTIFY"));
    let _ = read_body(&mut socket).await;
    socket
        .write_all(&frame(FRAME_TYPE_RESPONSE, b"OK"))
        .await
        .expect("send identify OK");

    let pub_line = read_line(&mut socket).await;
    assert_eq!(pub_line, "PUB test-topic");
    let body = read_body(&mut socket).await;
    socket
        .write_all(&frame(FRAME_TYPE_RESPONSE, b"OK"))
        .await
        .expect("send pub OK");

    let _ = pub_body_tx.send(body);
}

#[tokio::test]
async fn publish_resolves_once_broker_answers_ok() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap().to_string();

    let (pub_body_tx, pub_body_rx) = oneshot::channel();
    tokio::spawn(run_mock_broker(listener, pub_body_tx));

    let config = ProducerConfig {
        nsqd_tcp_addresses: vec![addr],
        ..ProducerConfig::default()
    };
    let log = slog::Logger::root(slog::Discard, slog::o!());
    let producer = Arc::new(Producer::new(config, log));
    producer.start().await.expect("connects to mock broker");

    let result = tokio::time::timeout(Duration::from_secs(5), producer.publish("test-topic", b"hello"))
        .await
        .expect("publish did not hang");
    assert!(result.is_ok());

    let observed = tokio::time::timeout(Duration::from_secs(5), pub_body_rx)
        .await
        .expect("broker observed pub before timeout")
        .expect("pub channel not dropped");
    assert_eq!(&observed[..], b"hello");

    producer.close().await;
}
