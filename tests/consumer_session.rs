//! Integration test driving a real `BrokerSession`/`Consumer` against a
//! hand-rolled loopback broker that speaks just enough of the wire protocol
//! to negotiate identity, accept a subscription, push one message, and
//! observe the `FIN` sent back for it.
//!
//! Grounded on the pack's MQTT-client test harness style: a mock broker
//! bound to an ephemeral port, a spawned client under test, and assertions
//! against what the broker actually observed rather than against the
//! client's internals.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use nsq_client::{Consumer, ConsumerConfig, Message, SessionConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_MESSAGE: i32 = 2;
const FIXTURE_ID: [u8; 16] = *b"0123456789abcdef";

fn frame(frame_type: i32, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(4 + payload.len());
    body.put_i32(frame_type);
    body.put_slice(payload);
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_i32(body.len() as i32);
    out.extend_from_slice(&body);
    out
}

fn message_frame(id: [u8; 16], body: &[u8]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(26 + body.len());
    payload.put_i64(0);
    payload.put_u16(1);
    payload.put_slice(&id);
    payload.put_slice(body);
    frame(FRAME_TYPE_MESSAGE, &payload)
}

/// Reads one newline-terminated command line (no embedded newlines in any
/// of the commands this broker needs to understand).
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

/// Negotiates IDENTIFY/SUB with a literal "OK" on each (skipping feature
/// negotiation entirely, which `BrokerSession::identify` treats as success),
/// then pushes one MESSAGE frame and waits for the matching FIN, reporting
/// the id it saw back to the test through `fin_tx`.
async fn run_mock_broker(listener: TcpListener, fin_tx: oneshot::Sender<Vec<u8>>) {
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

    let sub_line = read_line(&mut socket).await;
    assert_eq!(sub_line, "SUB test-topic test-channel");
    socket
        .write_all(&frame(FRAME_TYPE_RESPONSE, b"OK"))
        .await
        .expect("send sub OK");

    socket
        .write_all(&message_frame(FIXTURE_ID, b"payload"))
        .await
        .expect("send message");

    let fin_line = read_line(&mut socket).await;
    let mut parts = fin_line.split(' ');
    assert_eq!(parts.next(), Some("FIN"));
    let id = parts.next().expect("fin carries an id").as_bytes().to_vec();
    let _ = fin_tx.send(id);
}

#[tokio::test]
async fn delivers_message_and_sends_fin_on_success() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap().to_string();

    let (fin_tx, fin_rx) = oneshot::channel();
    tokio::spawn(run_mock_broker(listener, fin_tx));

    let (delivered_tx, delivered_rx) = oneshot::channel();
    let delivered_tx = std::sync::Mutex::new(Some(delivered_tx));
    let handler: nsq_client::HandlerFn = Arc::new(move |msg: Message| {
        let tx = delivered_tx.lock().unwrap().take();
        Box::pin(async move {
            if let Some(tx) = tx {
                let _ = tx.send(msg.body.clone());
            }
            msg.finish()
        })
    });

    let (topic, channel, config) = ConsumerConfig::new("test-topic", "test-channel")
        .nsqd_tcp_addresses(vec![addr])
        .max_in_flight(1)
        .build()
        .expect("config builds");
    let mut config = config;
    config.session = SessionConfig {
        heartbeat_interval: Duration::from_secs(0),
        ..SessionConfig::default()
    };

    let log = slog::Logger::root(slog::Discard, slog::o!());
    let consumer = Arc::new(Consumer::new(&topic, &channel, config, handler, log).unwrap());
    consumer.start().unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), delivered_rx)
        .await
        .expect("handler ran before timeout")
        .expect("handler delivered body");
    assert_eq!(&body[..], b"payload");

    let fin_id = tokio::time::timeout(Duration::from_secs(5), fin_rx)
        .await
        .expect("broker observed fin before timeout")
        .expect("fin channel not dropped");
    assert_eq!(fin_id, FIXTURE_ID.to_vec());

    consumer.close();
    consumer.join(Some(Duration::from_secs(5))).await;
}
