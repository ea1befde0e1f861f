//! Drives two real `IcChannel`s over a loopback TCP socket through the
//! public event-loop API only (`drive_once`, `send_query`,
//! `poll_inbound_query`, `send_reply`): version handshake to `READY`,
//! then one query/reply roundtrip dispatched by hand on the server
//! side. `ic::channel`'s own unit tests reach into private helpers
//! (`read_frame_raw`/`flush_send_queue`) to isolate single steps; this
//! exercises the same path the way a real caller would.

use std::time::Duration;

use ic_rpc::ic::{ChannelConfig, ChannelState, IcChannel};
use tokio::net::TcpListener;

#[tokio::test]
async fn handshake_then_query_reply_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = IcChannel::accept_tcp(stream, ChannelConfig::default()).await.unwrap();

        // Version handshake.
        drive_until(&mut server, |c| c.state() == ChannelState::Ready).await;

        // Wait for the client's query, then reply to it doubled.
        let (header, payload) = loop {
            if let Some(got) = server.poll_inbound_query() {
                break got;
            }
            server.drive_once().await.unwrap();
        };
        let n = i32::from_le_bytes(payload.try_into().unwrap());
        server
            .send_reply(header.slot, ic_rpc::IcStatus::Ok, (n * 2).to_le_bytes().to_vec())
            .unwrap();
        server.drive_once().await.unwrap();
    });

    let mut client = IcChannel::connect_tcp(addr, ChannelConfig::default()).await.unwrap();
    drive_until(&mut client, |c| c.state() == ChannelState::Ready).await;

    let captured: std::sync::Arc<std::sync::Mutex<Option<(ic_rpc::IcStatus, Vec<u8>)>>> =
        std::sync::Arc::new(std::sync::Mutex::new(None));
    let captured2 = captured.clone();
    client
        .send_query(
            1,
            2,
            21i32.to_le_bytes().to_vec(),
            ic_rpc::ic::Priority::Normal,
            None,
            Box::new(move |status, payload| {
                *captured2.lock().unwrap() = Some((status, payload));
            }),
        )
        .unwrap();

    drive_until(&mut client, |_| captured.lock().unwrap().is_some()).await;
    server.await.unwrap();

    let (status, payload) = captured.lock().unwrap().take().unwrap();
    assert_eq!(status, ic_rpc::IcStatus::Ok);
    assert_eq!(i32::from_le_bytes(payload.try_into().unwrap()), 42);
}

async fn drive_until(channel: &mut IcChannel, mut done: impl FnMut(&IcChannel) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done(channel) {
            channel.drive_once().await.unwrap();
        }
    })
    .await
    .expect("condition not reached before timeout");
}
