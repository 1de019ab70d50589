//! Observe flows: registration, notification stream, deregistration and
//! the teardown paths.

mod support;

use std::io::Read;
use std::time::Duration;

use couart::msg::{Code, Message, OptionNumber, Type};
use couart::{Client, Timing, UartTransport};
use support::{MockConnecter, Peer};

fn client(connecter: MockConnecter) -> Client {
    let mut transport = UartTransport::with_connecter(Box::new(connecter));
    transport.set_timing(Timing {
        notification_handoff_timeout: Duration::from_millis(500),
        observe_close_grace: Duration::from_millis(100),
        ..Timing::default()
    });
    Client::with_transport(Box::new(transport))
}

/// Answers the registration request with a piggybacked 2.05 carrying the
/// given Observe sequence number; hands back the register message.
async fn accept_registration(peer: &mut Peer, observe_seq: u64, payload: &[u8]) -> Message {
    let req = peer.recv().await;
    assert_eq!(req.ty, Type::Confirmable);
    assert_eq!(req.code, Code::GET);
    assert_eq!(req.options().get(OptionNumber::OBSERVE).as_uint(), Some(0));

    let mut res = Message::new(Type::Acknowledgement, Code::CONTENT, req.message_id);
    res.token = req.token.clone();
    res.options_mut().set_uint(OptionNumber::OBSERVE, observe_seq);
    res.payload = payload.to_vec();
    peer.send(&res).await;
    req
}

fn notification(register: &Message, mid: u16, observe_seq: u64, payload: &[u8]) -> Message {
    let mut msg = Message::new(Type::Confirmable, Code::CONTENT, mid);
    msg.token = register.token.clone();
    msg.options_mut().set_uint(OptionNumber::OBSERVE, observe_seq);
    msg.payload = payload.to_vec();
    msg
}

#[tokio::test]
async fn observe_notify_and_cancel() {
    let (connecter, mut peer) = support::link();
    let probe = connecter.clone();

    let peer_task = tokio::spawn(async move {
        let register = accept_registration(&mut peer, 10, b"state0").await;

        // Two confirmable notifications; each must come back ACKed
        // before the next is processed.
        peer.send(&notification(&register, 0x0101, 11, b"state1"))
            .await;
        let ack = peer.recv().await;
        assert_eq!(ack.ty, Type::Acknowledgement);
        assert_eq!(ack.message_id, 0x0101);

        peer.send(&notification(&register, 0x0102, 12, b"state2"))
            .await;
        let ack = peer.recv().await;
        assert_eq!(ack.ty, Type::Acknowledgement);
        assert_eq!(ack.message_id, 0x0102);

        // Deregistration arrives on the same token.
        let deregister = peer.recv().await;
        assert_eq!(deregister.code, Code::GET);
        assert_eq!(deregister.token, register.token);
        assert_eq!(
            deregister.options().get(OptionNumber::OBSERVE).as_uint(),
            Some(1)
        );
        assert_eq!(deregister.ty, Type::NonConfirmable);

        let mut last = Message::new(Type::NonConfirmable, Code::CONTENT, deregister.message_id);
        last.token = deregister.token.clone();
        last.payload = b"state2".to_vec();
        peer.send(&last).await;
        peer
    });

    let client = client(connecter);
    let mut res = client
        .observe("coap+uart://mock/sensors/door")
        .await
        .unwrap();
    assert!(res.is_observing());
    assert_eq!(res.body.read_to_vec().unwrap(), b"state0");

    let mut n1 = res.next().await.expect("first notification");
    assert_eq!(n1.status, "2.05 Content");
    assert_eq!(n1.body.read_to_vec().unwrap(), b"state1");

    let mut n2 = res.next().await.expect("second notification");
    assert_eq!(n2.body.read_to_vec().unwrap(), b"state2");

    let cancel_res = client.cancel_observe(&res).await.unwrap();
    assert_eq!(cancel_res.status, "2.05 Content");

    // The notify loop has exited: the stream closes without another
    // delivery.
    assert!(res.next().await.is_none());

    // Grace period passes, then the interaction and connection fold.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let conn = probe.connection().unwrap();
    assert_eq!(conn.interaction_count(), 0);
    assert!(conn.is_closed());

    peer_task.await.unwrap();
}

#[tokio::test]
async fn error_notification_ends_the_observation() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let register = accept_registration(&mut peer, 1, b"here").await;

        // The resource disappears; the server notifies the error and
        // expects the observer to go away.
        let mut gone = Message::new(Type::Confirmable, Code::NOT_FOUND, 0x0201);
        gone.token = register.token.clone();
        gone.options_mut().set_uint(OptionNumber::OBSERVE, 2);
        peer.send(&gone).await;

        // ACK for the delivered notification, then the RST that ends it.
        let ack = peer.recv().await;
        assert_eq!(ack.ty, Type::Acknowledgement);
        assert_eq!(ack.message_id, 0x0201);
        let rst = peer.recv().await;
        assert_eq!(rst.ty, Type::Reset);
        assert_eq!(rst.message_id, 0x0201);
        peer
    });

    let client = client(connecter);
    let mut res = client.observe("coap+uart://mock/gone").await.unwrap();
    assert!(res.is_observing());

    let gone = res.next().await.expect("error notification is delivered");
    assert_eq!(gone.status, "4.04 Not Found");
    assert!(res.next().await.is_none());

    peer_task.await.unwrap();
}

#[tokio::test]
async fn vanished_consumer_draws_a_rst() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let register = accept_registration(&mut peer, 1, b"x").await;

        // Nobody ever calls next(): the stream buffers absorb the first
        // notifications, then the handoff window runs out and the engine
        // answers with RST instead of ACK.
        let mut mid = 0x0300u16;
        loop {
            mid += 1;
            peer.send(&notification(&register, mid, u64::from(mid), b"y"))
                .await;
            let reply = peer.recv().await;
            if reply.ty == Type::Reset {
                assert_eq!(reply.message_id, mid);
                break;
            }
            assert_eq!(reply.ty, Type::Acknowledgement);
            assert_eq!(reply.message_id, mid);
            assert!(mid < 0x0310, "peer: engine keeps ACKing notifications");
        }
        peer
    });

    let client = client(connecter);
    let res = client.observe("coap+uart://mock/busy").await.unwrap();
    assert!(res.is_observing());
    // Keep `res` alive but never consume `next`.
    let _peer = peer_task.await.unwrap();
    drop(res);
}

#[tokio::test]
async fn closing_the_response_stops_the_notify_loop() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let register = accept_registration(&mut peer, 1, b"x").await;

        peer.send(&notification(&register, 0x0401, 2, b"n1")).await;
        let ack = peer.recv().await;
        assert_eq!(ack.ty, Type::Acknowledgement);
        peer
    });

    let client = client(connecter);
    let mut res = client.observe("coap+uart://mock/door").await.unwrap();

    let n1 = res.next().await.expect("notification before close");
    assert_eq!(n1.status_code, 69);

    // Close tears the loop down and waits for it; the stream is gone
    // afterwards.
    res.close().await;
    assert!(res.next().await.is_none());

    let mut body = res.body;
    let mut buf = [0u8; 8];
    assert_eq!(body.read(&mut buf).unwrap(), 0);

    let _peer = peer_task.await.unwrap();
}
