//! End-to-end request/response exchanges over the in-memory wire.

mod support;

use std::time::{Duration, Instant};

use couart::msg::{Code, Message, Token, Type};
use couart::{Body, Client, Error, Method, Request, UartTransport};
use support::MockConnecter;

fn client(connecter: MockConnecter) -> Client {
    Client::with_transport(Box::new(UartTransport::with_connecter(Box::new(connecter))))
}

#[tokio::test]
async fn piggybacked_get() {
    let (connecter, mut peer) = support::link();
    let probe = connecter.clone();

    let peer_task = tokio::spawn(async move {
        let req = peer.recv().await;
        assert_eq!(req.ty, Type::Confirmable);
        assert_eq!(req.code, Code::GET);
        assert_eq!(req.path(), "/temp");

        let mut res = Message::new(Type::Acknowledgement, Code::CONTENT, req.message_id);
        res.token = req.token.clone();
        res.payload = b"22.5 C".to_vec();
        peer.send(&res).await;
    });

    let client = client(connecter);
    let mut req = Request::new(Method::Get, "coap+uart://mock/temp", Body::empty()).unwrap();
    req.confirmable = true;
    let mut res = client.send(req).await.unwrap();

    assert_eq!(res.status_code, 69);
    assert_eq!(res.status, "2.05 Content");
    assert_eq!(res.body.read_to_vec().unwrap(), b"22.5 C");
    assert!(!res.is_observing());

    // The exchange is over: no interactions left, connection closed.
    let conn = probe.connection().unwrap();
    assert_eq!(conn.interaction_count(), 0);
    assert!(conn.is_closed());

    peer_task.await.unwrap();
}

#[tokio::test]
async fn separate_response() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let req = peer.recv().await;
        assert_eq!(req.ty, Type::Confirmable);

        // Empty ACK now: the answer needs time. It carries no token, so
        // the engine matches it by message id.
        peer.send(&Message::ack(req.message_id)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut res = Message::new(Type::Confirmable, Code::CONTENT, 0x23bb);
        res.token = req.token.clone();
        res.payload = b"22.5 C".to_vec();
        peer.send(&res).await;

        // The engine must confirm the separate CON.
        let ack = peer.recv().await;
        assert_eq!(ack.ty, Type::Acknowledgement);
        assert_eq!(ack.message_id, 0x23bb);
        assert!(ack.code.is_empty());
    });

    let client = client(connecter);
    let mut req = Request::new(Method::Get, "coap+uart://mock/temp", Body::empty()).unwrap();
    req.confirmable = true;
    let mut res = client.send(req).await.unwrap();

    assert_eq!(res.status, "2.05 Content");
    assert_eq!(res.body.read_to_vec().unwrap(), b"22.5 C");

    peer_task.await.unwrap();
}

#[tokio::test]
async fn ping_answered_by_rst() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let req = peer.recv().await;
        assert_eq!(req.ty, Type::Confirmable);
        assert!(req.code.is_empty());
        peer.send(&Message::rst(req.message_id)).await;
    });

    let client = client(connecter);
    let res = client.ping("coap+uart://mock").await.unwrap();
    assert_eq!(res.status_code, 0);

    peer_task.await.unwrap();
}

#[tokio::test]
async fn non_confirmable_exchange() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let req = peer.recv().await;
        assert_eq!(req.ty, Type::NonConfirmable);
        assert_eq!(req.code, Code::POST);
        assert_eq!(req.payload, b"on");

        let mut res = Message::new(Type::NonConfirmable, Code::CHANGED, req.message_id);
        res.token = req.token.clone();
        peer.send(&res).await;
    });

    let client = client(connecter);
    let res = client
        .post("coap+uart://mock/actuators/led", 0, Body::bytes("on"))
        .await
        .unwrap();
    assert_eq!(res.status, "2.04 Changed");

    peer_task.await.unwrap();
}

#[tokio::test]
async fn deadline_expires_on_silent_peer() {
    let (connecter, mut peer) = support::link();
    let probe = connecter.clone();

    let peer_task = tokio::spawn(async move {
        // Swallow the request, never answer. Holds the wire open so the
        // deadline, not a dead stream, ends the exchange.
        let _req = peer.recv().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(peer);
    });

    let mut client = client(connecter);
    client.timeout = Some(Duration::from_millis(500));

    let started = Instant::now();
    let mut req = Request::new(Method::Get, "coap+uart://mock/temp", Body::empty()).unwrap();
    req.confirmable = true;
    let err = client.send(req).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "got: {err}");
    assert!(elapsed >= Duration::from_millis(450), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "too slow: {elapsed:?}");

    // The failed interaction is gone and took the connection with it.
    let conn = probe.connection().unwrap();
    assert_eq!(conn.interaction_count(), 0);
    assert!(conn.is_closed());

    peer_task.abort();
}

#[tokio::test]
async fn user_cancel_unblocks_the_round_trip() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let _req = peer.recv().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(peer);
    });

    let client = client(connecter);
    let cancel = couart::CancelToken::new();
    let mut req = Request::new(Method::Get, "coap+uart://mock/temp", Body::empty()).unwrap();
    req.confirmable = true;
    req.cancel = Some(cancel.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = client.send(req).await.unwrap_err();
    assert!(err.is_timeout(), "got: {err}");

    peer_task.abort();
}

#[tokio::test]
async fn token_mismatch_fails_the_round_trip() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let req = peer.recv().await;
        // A piggybacked response that lost its token: matched by message
        // id, rejected by the token check.
        let mut res = Message::new(Type::Acknowledgement, Code::CONTENT, req.message_id);
        res.payload = b"nope".to_vec();
        peer.send(&res).await;
    });

    let client = client(connecter);
    let mut req = Request::new(Method::Get, "coap+uart://mock/temp", Body::empty()).unwrap();
    req.confirmable = true;
    let err = client.send(req).await.unwrap_err();
    assert!(
        matches!(err.root(), Error::TokenMismatch { .. }),
        "got: {err}"
    );

    peer_task.await.unwrap();
}

#[tokio::test]
async fn unexpected_type_fails_the_round_trip() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let req = peer.recv().await;
        // NON where an ACK belongs.
        let mut res = Message::new(Type::NonConfirmable, Code::CONTENT, req.message_id);
        res.token = req.token.clone();
        peer.send(&res).await;
    });

    let client = client(connecter);
    let mut req = Request::new(Method::Get, "coap+uart://mock/temp", Body::empty()).unwrap();
    req.confirmable = true;
    let err = client.send(req).await.unwrap_err();
    assert!(
        matches!(err.root(), Error::UnexpectedType { .. }),
        "got: {err}"
    );

    peer_task.await.unwrap();
}

#[tokio::test]
async fn orphan_messages_are_dropped() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        let req = peer.recv().await;

        // Unsolicited message for a token nobody owns.
        let mut stray = Message::new(Type::NonConfirmable, Code::CONTENT, 0x9999);
        stray.token = Token::from_slice(&[0xde, 0xad]).unwrap();
        peer.send(&stray).await;

        let mut res = Message::new(Type::Acknowledgement, Code::CONTENT, req.message_id);
        res.token = req.token.clone();
        res.payload = b"ok".to_vec();
        peer.send(&res).await;
    });

    let client = client(connecter);
    let mut req = Request::new(Method::Get, "coap+uart://mock/temp", Body::empty()).unwrap();
    req.confirmable = true;
    let mut res = client.send(req).await.unwrap();
    assert_eq!(res.body.read_to_vec().unwrap(), b"ok");

    peer_task.await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_demultiplex_by_token() {
    let (connecter, mut peer) = support::link();

    let peer_task = tokio::spawn(async move {
        // Both requests arrive before either is answered; answer them in
        // reverse order to prove correlation is by token, not arrival.
        let first = peer.recv().await;
        let second = peer.recv().await;
        assert_ne!(first.token, second.token);
        assert_eq!(first.message_id, 1);
        assert_eq!(second.message_id, 2);

        for req in [&second, &first] {
            let mut res = Message::new(Type::Acknowledgement, Code::CONTENT, req.message_id);
            res.token = req.token.clone();
            res.payload = req.path().into_bytes();
            peer.send(&res).await;
        }
    });

    let client = std::sync::Arc::new(client(connecter));

    let a = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut req =
                Request::new(Method::Get, "coap+uart://mock/alpha", Body::empty()).unwrap();
            req.confirmable = true;
            client.send(req).await
        })
    };
    // Deterministic send order for the message-id assertion.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut req =
                Request::new(Method::Get, "coap+uart://mock/beta", Body::empty()).unwrap();
            req.confirmable = true;
            client.send(req).await
        })
    };

    let mut res_a = a.await.unwrap().unwrap();
    let mut res_b = b.await.unwrap().unwrap();
    assert_eq!(res_a.body.read_to_vec().unwrap(), b"/alpha");
    assert_eq!(res_b.body.read_to_vec().unwrap(), b"/beta");

    peer_task.await.unwrap();
}

#[tokio::test]
async fn wrong_scheme_is_rejected() {
    let (connecter, _peer) = support::link();
    let client = client(connecter);
    let err = client.get("coap://mock/temp").await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "got: {err}");
}
